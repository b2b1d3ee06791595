//! # Whisper Engine
//!
//! Candle implementation of `SpeechRecognizer`.
//!
//! ## Loading Process:
//! 1. Map the identifier to a hub repository (`tiny.en` → `openai/whisper-tiny.en`)
//! 2. Download `config.json`, `tokenizer.json` and `model.safetensors` into the
//!    `stt/` cache through `hf-hub`
//! 3. Pick the device and dtype, then build one model instance per worker
//!
//! ## Decoding:
//! Audio is converted to log-mel features once and decoded in 30 second
//! windows, one window per iterator step. Each window is conditioned on the
//! initial prompt and the text decoded so far, uses timestamp tokens to split
//! segments, and is skipped when the model classifies it as silence.
//! Temperature 0 runs beam search (greedy for a beam of 1); a positive
//! temperature samples `best_of` candidates and keeps the most likely one.

use super::audio::{drop_non_speech, AudioLoader, SAMPLE_RATE};
use super::mel::mel_filters;
use super::{
    DecodeOptions, EngineSegment, EngineSettings, RecognizerLoader, SegmentStream, SpeechRecognizer,
    TranscriptionInfo,
};
use crate::device::{create_device_from_string, select_dtype, DeviceManager};
use crate::process::ProcessRunner;
use anyhow::{anyhow, bail, Context, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::whisper::{self as m, Config};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokenizers::Tokenizer;
use tracing::{debug, info};

/// Seconds per timestamp token step.
const TIME_PRECISION: f64 = 0.02;

/// Latest allowed first timestamp in a window, in timestamp steps (1.0 s).
const MAX_INITIAL_TIMESTAMP_INDEX: u32 = 50;

/// Language codes known to multilingual Whisper checkpoints.
const LANGUAGES: &[&str] = &[
    "en", "zh", "de", "es", "ru", "ko", "fr", "ja", "pt", "tr", "pl", "ca", "nl", "ar", "sv", "it", "id",
    "hi", "fi", "vi", "he", "uk", "el", "ms", "cs", "ro", "da", "hu", "ta", "no", "th", "ur", "hr", "bg",
    "lt", "la", "mi", "ml", "cy", "sk", "te", "fa", "lv", "bn", "sr", "az", "sl", "kn", "et", "mk", "br",
    "eu", "is", "hy", "ne", "mn", "bs", "kk", "sq", "sw", "gl", "mr", "pa", "si", "km", "sn", "yo", "so",
    "af", "oc", "ka", "be", "tg", "sd", "gu", "am", "yi", "lo", "uz", "fo", "ht", "ps", "tk", "nn", "mt",
    "sa", "lb", "my", "bo", "tl", "mg", "as", "tt", "haw", "ln", "ha", "ba", "jw", "su", "yue",
];

/// Hub repository for a model identifier.
///
/// Namespaced identifiers are used verbatim; bare names must be one of the
/// published Whisper sizes.
pub fn repository_for(identifier: &str) -> Result<String> {
    let identifier = identifier.trim();
    if identifier.contains('/') {
        return Ok(identifier.to_string());
    }
    let repo = match identifier.to_lowercase().as_str() {
        "tiny" => "openai/whisper-tiny",
        "tiny.en" => "openai/whisper-tiny.en",
        "base" => "openai/whisper-base",
        "base.en" => "openai/whisper-base.en",
        "small" => "openai/whisper-small",
        "small.en" => "openai/whisper-small.en",
        "medium" => "openai/whisper-medium",
        "medium.en" => "openai/whisper-medium.en",
        "large" | "large-v2" => "openai/whisper-large-v2",
        "large-v3" => "openai/whisper-large-v3",
        "turbo" | "large-v3-turbo" => "openai/whisper-large-v3-turbo",
        "distil-large-v3" => "distil-whisper/distil-large-v3",
        _ => bail!(
            "unknown whisper model '{}' (expected a size such as 'tiny.en' or 'large-v3', \
             or a hub repository)",
            identifier
        ),
    };
    Ok(repo.to_string())
}

/// Loads Whisper checkpoints from the hub.
pub struct WhisperLoader {
    runner: Arc<dyn ProcessRunner>,
}

impl WhisperLoader {
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self { runner }
    }
}

impl RecognizerLoader for WhisperLoader {
    fn load(&self, identifier: &str, settings: &EngineSettings) -> Result<Arc<dyn SpeechRecognizer>> {
        let repo_id = repository_for(identifier)?;
        let started = Instant::now();

        let api = hf_hub::api::sync::ApiBuilder::new()
            .with_endpoint(settings.hub_endpoint.trim_end_matches('/').to_string())
            .with_cache_dir(settings.download_root.clone())
            .with_token(std::env::var("HF_TOKEN").ok())
            .with_progress(false)
            .build()
            .context("failed to create hub client")?;
        let repo = api.model(repo_id.clone());

        info!(model = %identifier, repo = %repo_id, "Fetching Whisper model files");
        let config_path = repo
            .get("config.json")
            .with_context(|| format!("failed to download config.json from {}", repo_id))?;
        let tokenizer_path = repo
            .get("tokenizer.json")
            .with_context(|| format!("failed to download tokenizer.json from {}", repo_id))?;
        let weights_path = repo
            .get("model.safetensors")
            .with_context(|| format!("failed to download model.safetensors from {}", repo_id))?;

        let config: Config = serde_json::from_reader(std::fs::File::open(&config_path)?)
            .with_context(|| format!("invalid config.json in {}", repo_id))?;
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow!("failed to load tokenizer: {}", e))?;

        let device = create_device_from_string(&settings.device);
        let dtype = select_dtype(&settings.compute_type, &device);
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights_path], dtype, &device)? };

        let workers = (0..settings.workers.max(1))
            .map(|_| m::model::Whisper::load(&vb, config.clone()).map(Mutex::new))
            .collect::<candle_core::Result<Vec<_>>>()?;

        let audio = AudioLoader::new(
            Arc::clone(&self.runner),
            settings.ffmpeg_binary.clone(),
            settings.ffmpeg_timeout,
        );
        let recognizer = WhisperRecognizer::new(identifier, config, tokenizer, device, dtype, workers, audio)?;

        info!(
            model = %identifier,
            device = DeviceManager::get_device_info(&recognizer.device),
            dtype = ?dtype,
            workers = recognizer.workers.len(),
            multilingual = recognizer.multilingual,
            elapsed_ms = %started.elapsed().as_millis(),
            "Whisper model loaded"
        );
        Ok(Arc::new(recognizer))
    }
}

/// Special token ids resolved from the tokenizer.
#[derive(Debug, Clone, Copy)]
struct SpecialTokens {
    sot: u32,
    eot: u32,
    transcribe: u32,
    start_of_prev: u32,
    no_timestamps: u32,
    timestamp_begin: u32,
    no_speech: Option<u32>,
}

impl SpecialTokens {
    fn from_tokenizer(tokenizer: &Tokenizer) -> Result<Self> {
        let id = |token: &str| {
            tokenizer
                .token_to_id(token)
                .ok_or_else(|| anyhow!("tokenizer has no '{}' token", token))
        };
        let no_timestamps = id(m::NO_TIMESTAMPS_TOKEN)?;
        Ok(Self {
            sot: id(m::SOT_TOKEN)?,
            eot: id(m::EOT_TOKEN)?,
            transcribe: id(m::TRANSCRIBE_TOKEN)?,
            start_of_prev: id("<|startofprev|>")?,
            no_timestamps,
            timestamp_begin: no_timestamps + 1,
            no_speech: m::NO_SPEECH_TOKENS
                .iter()
                .find_map(|token| tokenizer.token_to_id(token)),
        })
    }
}

pub struct WhisperRecognizer {
    identifier: String,
    config: Config,
    tokenizer: Tokenizer,
    tokens: SpecialTokens,
    language_tokens: Vec<(&'static str, u32)>,
    multilingual: bool,
    mel_filters: Vec<f32>,
    device: Device,
    dtype: DType,
    workers: Vec<Mutex<m::model::Whisper>>,
    next_worker: AtomicUsize,
    audio: AudioLoader,
}

impl WhisperRecognizer {
    fn new(
        identifier: &str,
        config: Config,
        tokenizer: Tokenizer,
        device: Device,
        dtype: DType,
        workers: Vec<Mutex<m::model::Whisper>>,
        audio: AudioLoader,
    ) -> Result<Self> {
        let tokens = SpecialTokens::from_tokenizer(&tokenizer)?;
        let language_tokens = LANGUAGES
            .iter()
            .filter_map(|code| {
                tokenizer
                    .token_to_id(&format!("<|{}|>", code))
                    .map(|id| (*code, id))
            })
            .collect();
        // English-only checkpoints have one fewer token than multilingual ones.
        let multilingual = config.vocab_size >= 51865;
        let mel_filters = mel_filters(config.num_mel_bins);

        Ok(Self {
            identifier: identifier.to_string(),
            config,
            tokenizer,
            tokens,
            language_tokens,
            multilingual,
            mel_filters,
            device,
            dtype,
            workers,
            next_worker: AtomicUsize::new(0),
            audio,
        })
    }

    /// Take an idle model instance, or wait for the next one in rotation.
    fn acquire_worker(&self) -> MutexGuard<'_, m::model::Whisper> {
        for worker in &self.workers {
            if let Ok(guard) = worker.try_lock() {
                return guard;
            }
        }
        let index = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn language_token(&self, language: &str) -> Result<u32> {
        let code = language.trim().to_lowercase();
        self.language_tokens
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, id)| *id)
            .ok_or_else(|| anyhow!("unsupported language '{}'", language))
    }

    fn encode_prompt(&self, prompt: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(format!(" {}", prompt.trim()), false)
            .map_err(|e| anyhow!("failed to tokenize prompt: {}", e))?;
        Ok(encoding
            .get_ids()
            .iter()
            .copied()
            .filter(|id| *id < self.tokens.eot)
            .collect())
    }

    fn decode_text(&self, tokens: &[u32]) -> Result<String> {
        self.tokenizer
            .decode(tokens, true)
            .map_err(|e| anyhow!("failed to decode tokens: {}", e))
    }

    /// Raw next-token logits for `tokens`.
    fn next_logits(
        &self,
        model: &mut m::model::Whisper,
        tokens: &[u32],
        audio_features: &Tensor,
        flush: bool,
    ) -> Result<Vec<f32>> {
        let input = Tensor::new(tokens, &self.device)?.unsqueeze(0)?;
        let ys = model.decoder.forward(&input, audio_features, flush)?;
        let (_, seq_len, _) = ys.dims3()?;
        let logits = model
            .decoder
            .final_linear(&ys.i((..1, seq_len - 1..))?)?
            .i(0)?
            .i(0)?
            .to_dtype(DType::F32)?;
        Ok(logits.to_vec1::<f32>()?)
    }

    /// Probability that the window contains no speech, read at the SOT position.
    fn no_speech_probability(
        &self,
        model: &mut m::model::Whisper,
        prefix: &[u32],
        sot_index: usize,
        audio_features: &Tensor,
    ) -> Result<f64> {
        let Some(no_speech) = self.tokens.no_speech else {
            return Ok(0.0);
        };
        let input = Tensor::new(prefix, &self.device)?.unsqueeze(0)?;
        let ys = model.decoder.forward(&input, audio_features, true)?;
        let logits = model
            .decoder
            .final_linear(&ys.i((..1, sot_index..sot_index + 1))?)?
            .i(0)?
            .i(0)?
            .to_dtype(DType::F32)?
            .to_vec1::<f32>()?;
        let logprobs = log_softmax(&logits);
        Ok(logprobs
            .get(no_speech as usize)
            .map(|lp| (*lp as f64).exp())
            .unwrap_or(0.0))
    }

    fn detect_language(&self, model: &mut m::model::Whisper, audio_features: &Tensor) -> Result<(&'static str, u32)> {
        let logits = self.next_logits(model, &[self.tokens.sot], audio_features, true)?;
        self.language_tokens
            .iter()
            .copied()
            .max_by(|a, b| logits[a.1 as usize].total_cmp(&logits[b.1 as usize]))
            .ok_or_else(|| anyhow!("tokenizer has no language tokens"))
    }

    /// Log-probabilities for the next token after applying suppression and
    /// timestamp rules.
    fn next_logprobs(
        &self,
        model: &mut m::model::Whisper,
        prefix: &[u32],
        generated: &[u32],
        audio_features: &Tensor,
    ) -> Result<Vec<f32>> {
        let mut sequence = Vec::with_capacity(prefix.len() + generated.len());
        sequence.extend_from_slice(prefix);
        sequence.extend_from_slice(generated);
        let mut logits = self.next_logits(model, &sequence, audio_features, false)?;
        for &token in &self.config.suppress_tokens {
            if let Some(l) = logits.get_mut(token as usize) {
                *l = f32::NEG_INFINITY;
            }
        }
        let rules = TimestampRules {
            eot: self.tokens.eot,
            no_timestamps: self.tokens.no_timestamps,
            timestamp_begin: self.tokens.timestamp_begin,
        };
        rules.apply(&mut logits, generated);
        Ok(log_softmax(&logits))
    }

    fn max_new_tokens(&self, prefix_len: usize) -> usize {
        let limit = self.config.max_target_positions;
        (limit / 2).min(limit.saturating_sub(prefix_len + 1))
    }

    fn beam_search(
        &self,
        model: &mut m::model::Whisper,
        prefix: &[u32],
        audio_features: &Tensor,
        beam_size: usize,
    ) -> Result<Hypothesis> {
        let beam_size = beam_size.max(1);
        let mut live = vec![Hypothesis::default()];
        let mut finished: Vec<Hypothesis> = Vec::new();

        for _ in 0..self.max_new_tokens(prefix.len()) {
            let mut candidates = Vec::with_capacity(live.len() * (beam_size + 1));
            for hypothesis in &live {
                let logprobs = self.next_logprobs(model, prefix, &hypothesis.tokens, audio_features)?;
                for (token, logprob) in top_k(&logprobs, beam_size + 1) {
                    candidates.push(hypothesis.extend(token, logprob));
                }
            }
            candidates.sort_by(|a, b| b.sum_logprob.total_cmp(&a.sum_logprob));

            live.clear();
            for candidate in candidates {
                if candidate.tokens.last() == Some(&self.tokens.eot) {
                    if finished.len() < beam_size {
                        finished.push(candidate);
                    }
                } else {
                    live.push(candidate);
                }
                if live.len() >= beam_size {
                    break;
                }
            }
            if finished.len() >= beam_size || live.is_empty() {
                break;
            }
        }

        finished.extend(live);
        best_hypothesis(finished)
    }

    fn sample_best_of(
        &self,
        model: &mut m::model::Whisper,
        prefix: &[u32],
        audio_features: &Tensor,
        temperature: f64,
        best_of: usize,
        rng: &mut StdRng,
    ) -> Result<Hypothesis> {
        let mut candidates = Vec::with_capacity(best_of.max(1));
        for _ in 0..best_of.max(1) {
            let mut hypothesis = Hypothesis::default();
            for _ in 0..self.max_new_tokens(prefix.len()) {
                let logprobs = self.next_logprobs(model, prefix, &hypothesis.tokens, audio_features)?;
                let weights = temperature_weights(&logprobs, temperature);
                let token = WeightedIndex::new(&weights)
                    .map_err(|e| anyhow!("sampling failed: {}", e))?
                    .sample(rng) as u32;
                hypothesis = hypothesis.extend(token, logprobs[token as usize]);
                if token == self.tokens.eot {
                    break;
                }
            }
            candidates.push(hypothesis);
        }
        best_hypothesis(candidates)
    }

    /// Decode one window of mel frames starting at `time_offset` seconds.
    fn decode_window(
        &self,
        model: &mut m::model::Whisper,
        state: &mut DecodeState,
        mel: &Tensor,
        time_offset: f64,
        window_end: f64,
    ) -> Result<Vec<EngineSegment>> {
        let audio_features = model.encoder.forward(mel, true)?;

        if state.language_token.is_none() && self.multilingual {
            let (code, token) = self.detect_language(model, &audio_features)?;
            debug!(language = code, "Detected language");
            state.language = Some(code.to_string());
            state.language_token = Some(token);
        }

        let mut prefix = Vec::new();
        if !state.context.is_empty() {
            let keep = self.config.max_target_positions / 2 - 1;
            let start = state.context.len().saturating_sub(keep);
            prefix.push(self.tokens.start_of_prev);
            prefix.extend_from_slice(&state.context[start..]);
        }
        let sot_index = prefix.len();
        prefix.push(self.tokens.sot);
        if self.multilingual {
            if let Some(language) = state.language_token {
                prefix.push(language);
            }
            prefix.push(self.tokens.transcribe);
        }

        // Primes the cross-attention cache for this window as well.
        let no_speech_prob = self.no_speech_probability(model, &prefix, sot_index, &audio_features)?;

        let best = if state.options.temperature > 0.0 {
            self.sample_best_of(
                model,
                &prefix,
                &audio_features,
                state.options.temperature,
                state.options.best_of,
                &mut state.rng,
            )?
        } else {
            self.beam_search(model, &prefix, &audio_features, state.options.beam_size)?
        };

        let avg_logprob = best.average_logprob();
        if no_speech_prob > m::NO_SPEECH_THRESHOLD && avg_logprob < m::LOGPROB_THRESHOLD {
            debug!(offset = time_offset, no_speech_prob, avg_logprob, "Skipping silent window");
            return Ok(Vec::new());
        }

        let generated: Vec<u32> = best
            .tokens
            .iter()
            .copied()
            .take_while(|t| *t != self.tokens.eot)
            .collect();

        let mut segments = Vec::new();
        for span in split_on_timestamps(&generated, self.tokens.timestamp_begin, self.tokens.eot) {
            let text = self.decode_text(&span.tokens)?;
            if text.trim().is_empty() {
                continue;
            }
            let start = span.start.map(|s| time_offset + s).unwrap_or(time_offset);
            let end = span
                .end
                .map(|e| time_offset + e)
                .unwrap_or(window_end)
                .min(window_end)
                .max(start);
            segments.push(EngineSegment { start, end, text });
        }

        state.context.extend_from_slice(&generated);
        Ok(segments)
    }
}

impl SpeechRecognizer for WhisperRecognizer {
    fn transcribe<'a>(&'a self, audio_path: &Path, options: &DecodeOptions) -> Result<Box<dyn SegmentStream + 'a>> {
        let samples = self.audio.load(audio_path)?;
        let duration = samples.len() as f64 / SAMPLE_RATE as f64;
        let samples = if options.vad_filter {
            drop_non_speech(&samples)
        } else {
            samples
        };

        let (language, language_token) = match options.language.as_deref() {
            Some(language) if self.multilingual => {
                let token = self.language_token(language)?;
                (Some(language.trim().to_lowercase()), Some(token))
            }
            _ if !self.multilingual => (Some("en".to_string()), None),
            _ => (None, None),
        };

        let context = match options.initial_prompt.as_deref() {
            Some(prompt) if !prompt.trim().is_empty() => self.encode_prompt(prompt)?,
            _ => Vec::new(),
        };

        let mel = m::audio::pcm_to_mel(&self.config, &samples, &self.mel_filters);
        let n_mels = self.config.num_mel_bins;
        let total_frames = mel.len() / n_mels;
        let mel = Tensor::from_vec(mel, (1, n_mels, total_frames), &self.device)?.to_dtype(self.dtype)?;
        let content_frames = samples.len().div_ceil(m::HOP_LENGTH).min(total_frames);

        debug!(
            model = %self.identifier,
            audio_s = duration,
            voiced_s = samples.len() as f64 / SAMPLE_RATE as f64,
            windows = content_frames.div_ceil(m::N_FRAMES),
            "Prepared audio features"
        );

        Ok(Box::new(WhisperStream {
            recognizer: self,
            model: self.acquire_worker(),
            mel,
            total_frames,
            content_frames,
            seek: 0,
            pending: VecDeque::new(),
            state: DecodeState {
                options: options.clone(),
                language,
                language_token,
                context,
                rng: StdRng::from_entropy(),
            },
            duration,
            failed: false,
        }))
    }
}

/// Per-stream decoding state carried from one window to the next.
struct DecodeState {
    options: DecodeOptions,
    language: Option<String>,
    language_token: Option<u32>,
    /// Prompt plus every token decoded so far.
    context: Vec<u32>,
    rng: StdRng,
}

struct WhisperStream<'a> {
    recognizer: &'a WhisperRecognizer,
    model: MutexGuard<'a, m::model::Whisper>,
    mel: Tensor,
    total_frames: usize,
    content_frames: usize,
    seek: usize,
    pending: VecDeque<EngineSegment>,
    state: DecodeState,
    duration: f64,
    failed: bool,
}

impl WhisperStream<'_> {
    fn decode_next_window(&mut self) -> Result<Vec<EngineSegment>> {
        let frames_per_second = (SAMPLE_RATE as usize / m::HOP_LENGTH) as f64;
        let segment_size = m::N_FRAMES.min(self.total_frames - self.seek);
        let window = self.mel.narrow(2, self.seek, segment_size)?;
        let time_offset = self.seek as f64 / frames_per_second;
        let window_end = (self.seek + m::N_FRAMES).min(self.content_frames) as f64 / frames_per_second;
        self.seek += m::N_FRAMES;

        self.recognizer
            .decode_window(&mut self.model, &mut self.state, &window, time_offset, window_end)
    }
}

impl Iterator for WhisperStream<'_> {
    type Item = Result<EngineSegment>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(segment) = self.pending.pop_front() {
                return Some(Ok(segment));
            }
            if self.failed || self.seek >= self.content_frames {
                return None;
            }
            match self.decode_next_window() {
                Ok(segments) => self.pending.extend(segments),
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

impl SegmentStream for WhisperStream<'_> {
    fn info(&self) -> TranscriptionInfo {
        TranscriptionInfo {
            language: self.state.language.clone(),
            duration: self.duration,
        }
    }
}

/// A decoded token sequence and its accumulated log-probability.
#[derive(Debug, Clone, Default, PartialEq)]
struct Hypothesis {
    tokens: Vec<u32>,
    sum_logprob: f64,
}

impl Hypothesis {
    fn extend(&self, token: u32, logprob: f32) -> Self {
        let mut tokens = self.tokens.clone();
        tokens.push(token);
        Self {
            tokens,
            sum_logprob: self.sum_logprob + logprob as f64,
        }
    }

    fn average_logprob(&self) -> f64 {
        if self.tokens.is_empty() {
            f64::NEG_INFINITY
        } else {
            self.sum_logprob / self.tokens.len() as f64
        }
    }
}

fn best_hypothesis(candidates: Vec<Hypothesis>) -> Result<Hypothesis> {
    candidates
        .into_iter()
        .max_by(|a, b| a.average_logprob().total_cmp(&b.average_logprob()))
        .ok_or_else(|| anyhow!("decoder produced no candidates"))
}

/// Whisper's timestamp constraints on the next token.
struct TimestampRules {
    eot: u32,
    no_timestamps: u32,
    timestamp_begin: u32,
}

impl TimestampRules {
    fn apply(&self, logits: &mut [f32], generated: &[u32]) {
        let begin = self.timestamp_begin as usize;
        let eot = self.eot as usize;
        let vocab = logits.len();
        if begin >= vocab {
            return;
        }
        if let Some(l) = logits.get_mut(self.no_timestamps as usize) {
            *l = f32::NEG_INFINITY;
        }

        // Tokens between EOT and the first timestamp are never emitted as text.
        for l in &mut logits[(eot + 1).min(begin)..begin] {
            *l = f32::NEG_INFINITY;
        }

        if generated.is_empty() {
            // A window opens with a timestamp no later than one second in.
            logits[..begin].fill(f32::NEG_INFINITY);
            let last_allowed = (begin + MAX_INITIAL_TIMESTAMP_INDEX as usize + 1).min(vocab);
            logits[last_allowed..].fill(f32::NEG_INFINITY);
            return;
        }

        let is_ts = |t: u32| t >= self.timestamp_begin;
        let last_was_ts = generated.last().copied().is_some_and(is_ts);
        let penultimate_was_ts = generated.len() < 2 || is_ts(generated[generated.len() - 2]);

        if last_was_ts {
            if penultimate_was_ts {
                logits[begin..].fill(f32::NEG_INFINITY);
            } else {
                logits[..eot].fill(f32::NEG_INFINITY);
            }
        }

        // Timestamps never go backwards.
        if let Some(&last_ts) = generated.iter().rev().find(|t| is_ts(**t)) {
            let floor = if last_was_ts && !penultimate_was_ts {
                last_ts
            } else {
                last_ts + 1
            };
            let floor = (floor as usize).min(vocab);
            logits[begin..floor].fill(f32::NEG_INFINITY);
        }

        // Prefer a timestamp when, taken together, they outweigh any text token.
        let logprobs = log_softmax(logits);
        let timestamp_mass = log_sum_exp(&logprobs[begin..]);
        let best_text = logprobs[..begin]
            .iter()
            .copied()
            .fold(f32::NEG_INFINITY, f32::max);
        if timestamp_mass > best_text {
            logits[..begin].fill(f32::NEG_INFINITY);
        }
    }
}

/// A run of text tokens and the timestamps around it, relative to the window.
#[derive(Debug, Clone, PartialEq)]
struct TimedSpan {
    start: Option<f64>,
    end: Option<f64>,
    tokens: Vec<u32>,
}

fn split_on_timestamps(tokens: &[u32], timestamp_begin: u32, eot: u32) -> Vec<TimedSpan> {
    let mut spans = Vec::new();
    let mut start = None;
    let mut text = Vec::new();

    for &token in tokens {
        if token >= timestamp_begin {
            let time = (token - timestamp_begin) as f64 * TIME_PRECISION;
            if text.is_empty() {
                start = Some(time);
            } else {
                spans.push(TimedSpan {
                    start,
                    end: Some(time),
                    tokens: std::mem::take(&mut text),
                });
                start = Some(time);
            }
        } else if token < eot {
            text.push(token);
        }
    }
    if !text.is_empty() {
        spans.push(TimedSpan {
            start,
            end: None,
            tokens: text,
        });
    }
    spans
}

fn log_sum_exp(values: &[f32]) -> f32 {
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        return f32::NEG_INFINITY;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f32>().ln()
}

fn log_softmax(logits: &[f32]) -> Vec<f32> {
    let norm = log_sum_exp(logits);
    logits.iter().map(|l| l - norm).collect()
}

/// The `k` most likely tokens, best first.
fn top_k(logprobs: &[f32], k: usize) -> Vec<(u32, f32)> {
    let mut ranked: Vec<(u32, f32)> = logprobs
        .iter()
        .enumerate()
        .filter(|(_, lp)| lp.is_finite())
        .map(|(i, lp)| (i as u32, *lp))
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranked.truncate(k);
    ranked
}

/// Sampling weights proportional to `softmax(logprobs / temperature)`.
fn temperature_weights(logprobs: &[f32], temperature: f64) -> Vec<f64> {
    let max = logprobs.iter().copied().fold(f32::NEG_INFINITY, f32::max) as f64;
    logprobs
        .iter()
        .map(|lp| {
            let lp = *lp as f64;
            if lp.is_finite() {
                ((lp - max) / temperature).exp()
            } else {
                0.0
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const EOT: u32 = 10;
    const NO_TS: u32 = 13;
    const TS: u32 = 14;

    fn rules() -> TimestampRules {
        TimestampRules {
            eot: EOT,
            no_timestamps: NO_TS,
            timestamp_begin: TS,
        }
    }

    #[test]
    fn test_repository_mapping() {
        assert_eq!(repository_for("tiny.en").unwrap(), "openai/whisper-tiny.en");
        assert_eq!(repository_for(" base ").unwrap(), "openai/whisper-base");
        assert_eq!(repository_for("large").unwrap(), "openai/whisper-large-v2");
        assert_eq!(repository_for("turbo").unwrap(), "openai/whisper-large-v3-turbo");
        assert_eq!(repository_for("acme/whisper-atc").unwrap(), "acme/whisper-atc");
        assert!(repository_for("gigantic").is_err());
    }

    #[test]
    fn test_split_on_timestamp_pairs() {
        // <|0.00|> a b <|1.00|><|1.00|> c <|2.40|>
        let tokens = [TS, 1, 2, TS + 50, TS + 50, 3, TS + 120];
        let spans = split_on_timestamps(&tokens, TS, EOT);
        assert_eq!(spans.len(), 2);
        let close = |a: Option<f64>, b: f64| (a.unwrap() - b).abs() < 1e-9;

        assert_eq!(spans[0].tokens, vec![1, 2]);
        assert!(close(spans[0].start, 0.0) && close(spans[0].end, 1.0));
        assert_eq!(spans[1].tokens, vec![3]);
        assert!(close(spans[1].start, 1.0) && close(spans[1].end, 2.4));
    }

    #[test]
    fn test_split_keeps_unterminated_text() {
        let spans = split_on_timestamps(&[TS + 5, 4, 5, 11], TS, EOT);
        assert_eq!(spans.len(), 1);
        assert!((spans[0].start.unwrap() - 0.1).abs() < 1e-9);
        assert_eq!(spans[0].end, None);
        // Special tokens between EOT and the timestamps are not text.
        assert_eq!(spans[0].tokens, vec![4, 5]);
    }

    #[test]
    fn test_first_token_must_be_early_timestamp() {
        let mut logits = vec![0.0f32; TS as usize + 100];
        rules().apply(&mut logits, &[]);
        assert!(logits[..TS as usize].iter().all(|l| *l == f32::NEG_INFINITY));
        assert!(logits[TS as usize..=(TS + 50) as usize].iter().all(|l| l.is_finite()));
        assert!(logits[(TS + 51) as usize..].iter().all(|l| *l == f32::NEG_INFINITY));
    }

    #[test]
    fn test_timestamp_pairs_and_monotonicity() {
        // After text then a timestamp, only a timestamp or EOT may follow.
        let mut logits = vec![0.0f32; TS as usize + 100];
        logits[EOT as usize] = 10.0;
        rules().apply(&mut logits, &[TS, 1, TS + 20]);
        assert!(logits[..EOT as usize].iter().all(|l| *l == f32::NEG_INFINITY));
        assert!(logits[EOT as usize].is_finite());
        assert!(logits[TS as usize..(TS + 20) as usize]
            .iter()
            .all(|l| *l == f32::NEG_INFINITY));
        assert!(logits[(TS + 20) as usize].is_finite());

        // After two timestamps in a row, text must follow.
        let mut logits = vec![0.0f32; TS as usize + 100];
        logits[1] = 5.0;
        rules().apply(&mut logits, &[TS, 1, TS + 20, TS + 20]);
        assert!(logits[TS as usize..].iter().all(|l| *l == f32::NEG_INFINITY));
        assert!(logits[1].is_finite());
    }

    #[test]
    fn test_top_k_and_log_softmax() {
        let logprobs = log_softmax(&[1.0, 3.0, f32::NEG_INFINITY, 2.0]);
        let total: f32 = logprobs.iter().map(|l| l.exp()).sum();
        assert!((total - 1.0).abs() < 1e-5);

        let best = top_k(&logprobs, 2);
        assert_eq!(best.iter().map(|(t, _)| *t).collect::<Vec<_>>(), vec![1, 3]);
    }

    #[test]
    fn test_temperature_weights_ignore_suppressed_tokens() {
        let weights = temperature_weights(&[-1.0, f32::NEG_INFINITY, -2.0], 0.5);
        assert_eq!(weights[1], 0.0);
        assert_eq!(weights[0], 1.0);
        assert!(weights[2] > 0.0 && weights[2] < 1.0);
    }

    #[test]
    fn test_best_hypothesis_uses_mean_logprob() {
        let short = Hypothesis {
            tokens: vec![1],
            sum_logprob: -1.0,
        };
        let long = Hypothesis {
            tokens: vec![1, 2, 3, 4],
            sum_logprob: -2.0,
        };
        assert_eq!(best_hypothesis(vec![short, long.clone()]).unwrap(), long);
        assert!(best_hypothesis(Vec::new()).is_err());
    }
}
