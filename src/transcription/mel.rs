//! Slaney-style mel filterbank matching the one Whisper was trained with
//! (librosa `mel(sr=16000, n_fft=400, htk=False, norm="slaney")`).

use super::audio::SAMPLE_RATE;

/// FFT window used by Whisper's feature extractor.
pub const N_FFT: usize = 400;

/// Number of frequency bins produced by a real FFT of `N_FFT` samples.
pub const N_FREQS: usize = N_FFT / 2 + 1;

/// Filterbank laid out row-major as `[n_mels][N_FREQS]`, the layout
/// `whisper::audio::pcm_to_mel` expects.
pub fn mel_filters(n_mels: usize) -> Vec<f32> {
    let sample_rate = SAMPLE_RATE as f64;
    let fft_freqs: Vec<f64> = (0..N_FREQS)
        .map(|i| i as f64 * sample_rate / N_FFT as f64)
        .collect();

    let mel_min = hertz_to_mel(0.0);
    let mel_max = hertz_to_mel(sample_rate / 2.0);
    let edges: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hertz(mel_min + (mel_max - mel_min) * i as f64 / (n_mels + 1) as f64))
        .collect();

    let mut filters = vec![0f32; n_mels * N_FREQS];
    for m in 0..n_mels {
        let (lower, center, upper) = (edges[m], edges[m + 1], edges[m + 2]);
        let norm = 2.0 / (upper - lower);
        for (k, &freq) in fft_freqs.iter().enumerate() {
            let rising = (freq - lower) / (center - lower);
            let falling = (upper - freq) / (upper - center);
            let weight = rising.min(falling).max(0.0);
            filters[m * N_FREQS + k] = (weight * norm) as f32;
        }
    }
    filters
}

fn hertz_to_mel(freq: f64) -> f64 {
    const F_SP: f64 = 200.0 / 3.0;
    const MIN_LOG_HZ: f64 = 1000.0;
    let min_log_mel = MIN_LOG_HZ / F_SP;
    let logstep = (6.4f64).ln() / 27.0;

    if freq >= MIN_LOG_HZ {
        min_log_mel + (freq / MIN_LOG_HZ).ln() / logstep
    } else {
        freq / F_SP
    }
}

fn mel_to_hertz(mel: f64) -> f64 {
    const F_SP: f64 = 200.0 / 3.0;
    const MIN_LOG_HZ: f64 = 1000.0;
    let min_log_mel = MIN_LOG_HZ / F_SP;
    let logstep = (6.4f64).ln() / 27.0;

    if mel >= min_log_mel {
        MIN_LOG_HZ * (logstep * (mel - min_log_mel)).exp()
    } else {
        F_SP * mel
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filterbank_shape() {
        assert_eq!(mel_filters(80).len(), 80 * N_FREQS);
        assert_eq!(mel_filters(128).len(), 128 * N_FREQS);
    }

    #[test]
    fn test_filters_are_non_negative_and_non_empty() {
        let filters = mel_filters(80);
        assert!(filters.iter().all(|w| *w >= 0.0));
        for row in filters.chunks(N_FREQS) {
            assert!(row.iter().any(|w| *w > 0.0));
        }
    }

    #[test]
    fn test_mel_scale_round_trips() {
        for hz in [0.0, 440.0, 1000.0, 4000.0, 8000.0] {
            assert!((mel_to_hertz(hertz_to_mel(hz)) - hz).abs() < 1e-6);
        }
        // Linear below 1 kHz.
        assert!((hertz_to_mel(1000.0) - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_filter_peaks_increase_with_mel_index() {
        let filters = mel_filters(80);
        let peaks: Vec<usize> = filters
            .chunks(N_FREQS)
            .map(|row| {
                row.iter()
                    .enumerate()
                    .max_by(|a, b| a.1.total_cmp(b.1))
                    .map(|(i, _)| i)
                    .unwrap()
            })
            .collect();
        assert!(peaks.windows(2).all(|w| w[0] <= w[1]));
    }
}
