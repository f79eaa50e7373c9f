use rubato::{FastFixedIn, PolynomialDegree, Resampler};

/// Sample rate of the raw PCM16 the speech endpoint returns.
pub const TTS_PCM16_SAMPLE_RATE: f64 = 24000.0;

const RESAMPLE_CHUNK: usize = 1024;

/// Creates a resampler to convert between audio sample rates.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> anyhow::Result<FastFixedIn<f32>> {
    let resampler = FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,
        PolynomialDegree::Cubic,
        chunk_size,
        1,
    )?;
    Ok(resampler)
}

/// Splits a slice of audio samples into a vector of vectors, where each inner vector has a fixed chunk size.
/// If a chunk is smaller than the `chunk_size`, it is padded with zeros.
pub fn split_for_chunks(samples: &[f32], chunk_size: usize) -> Vec<Vec<f32>> {
    samples
        .chunks(chunk_size)
        .map(|chunk| {
            let mut chunk = chunk.to_vec();
            chunk.resize(chunk_size, 0.0);
            chunk
        })
        .collect()
}

/// Interprets little-endian PCM16 bytes as mono samples in `-1.0..=1.0`.
/// A trailing odd byte is ignored.
pub fn decode_pcm16(bytes: &[u8]) -> Vec<f32> {
    let pcm16: Vec<i16> = bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect();
    convert_i16_to_f32(&pcm16)
}

/// Converts a slice of i16 samples to a vector of f32 samples.
pub fn convert_i16_to_f32(pcm16: &[i16]) -> Vec<f32> {
    pcm16
        .iter()
        .map(|&sample| sample as f32 / 32768.0)
        .collect()
}

/// Resamples a whole mono clip. The zero padding of the last chunk is cut
/// off again so the clip keeps its duration.
pub fn resample(samples: &[f32], in_rate: f64, out_rate: f64) -> anyhow::Result<Vec<f32>> {
    if samples.is_empty() || (in_rate - out_rate).abs() < f64::EPSILON {
        return Ok(samples.to_vec());
    }
    let mut resampler = create_resampler(in_rate, out_rate, RESAMPLE_CHUNK)?;
    let mut out = Vec::with_capacity((samples.len() as f64 * out_rate / in_rate) as usize);
    for chunk in split_for_chunks(samples, RESAMPLE_CHUNK) {
        let frames = resampler.process(&[chunk], None)?;
        if let Some(channel) = frames.into_iter().next() {
            out.extend(channel);
        }
    }
    out.truncate((samples.len() as f64 * out_rate / in_rate).round() as usize);
    tracing::trace!(
        "resampled {} samples at {}hz into {} at {}hz",
        samples.len(),
        in_rate,
        out.len(),
        out_rate
    );
    Ok(out)
}

/// Repeats each mono sample across `channels` interleaved channels.
pub fn fan_out(mono: &[f32], channels: usize) -> Vec<f32> {
    mono.iter()
        .flat_map(|&sample| std::iter::repeat_n(sample, channels.max(1)))
        .collect()
}
