//! PCM helpers. Pure functions, no I/O.

/// Size of the canonical RIFF/WAVE header written by [`pcm_to_wav`].
pub const WAV_HEADER_LEN: usize = 44;

/// Wraps little-endian 16-bit PCM in a minimal WAV container.
pub fn pcm_to_wav(pcm: &[u8], sample_rate: u32, channels: u16) -> Vec<u8> {
    let data_len = pcm.len() as u32;
    let block_align = channels * 2;
    let byte_rate = sample_rate * u32::from(block_align);
    let mut buf = Vec::with_capacity(WAV_HEADER_LEN + pcm.len());

    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&(36 + data_len).to_le_bytes());
    buf.extend_from_slice(b"WAVE");

    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes()); // chunk size
    buf.extend_from_slice(&1u16.to_le_bytes()); // PCM
    buf.extend_from_slice(&channels.to_le_bytes());
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    buf.extend_from_slice(&byte_rate.to_le_bytes());
    buf.extend_from_slice(&block_align.to_le_bytes());
    buf.extend_from_slice(&16u16.to_le_bytes()); // bits per sample

    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&data_len.to_le_bytes());
    buf.extend_from_slice(pcm);

    buf
}

/// Reads the PCM payload length back out of a WAV produced by [`pcm_to_wav`].
pub fn wav_data_len(wav: &[u8]) -> Option<usize> {
    if wav.len() < WAV_HEADER_LEN || &wav[0..4] != b"RIFF" || &wav[36..40] != b"data" {
        return None;
    }
    let len = u32::from_le_bytes([wav[40], wav[41], wav[42], wav[43]]);
    Some(len as usize)
}

/// Decodes little-endian 16-bit PCM bytes. A trailing odd byte is ignored.
pub fn pcm_to_samples(pcm: &[u8]) -> Vec<i16> {
    pcm.chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

pub fn samples_to_pcm(samples: &[i16]) -> Vec<u8> {
    let mut pcm = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        pcm.extend_from_slice(&sample.to_le_bytes());
    }
    pcm
}

/// Playback duration of a PCM buffer in milliseconds.
pub fn pcm_duration_ms(pcm_len: usize, sample_rate: u32, channels: u16) -> u64 {
    let bytes_per_second = u64::from(sample_rate) * u64::from(channels) * 2;
    if bytes_per_second == 0 {
        return 0;
    }
    pcm_len as u64 * 1000 / bytes_per_second
}
