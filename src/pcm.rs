use crate::types::SampleI16;

/// 浮動小数点サンプル 1 つを 16bit PCM に量子化
///
/// -1.0 ~ 1.0 にクランプした後、負の値は 32768 倍、0 以上は 32767 倍して
/// 0 方向へ切り捨てる。-1.0 は -32768、1.0 は 32767 になる非対称な量子化で、
/// サーバー側の期待する値と一致させる必要がある。
///
/// NaN は 0 になる。
#[inline]
pub fn encode_sample(sample: f32) -> SampleI16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * 32768.0) as SampleI16
    } else {
        (s * 32767.0) as SampleI16
    }
}

/// フレーム全体を 16bit PCM に変換
///
/// # Examples
///
/// ```
/// # use voice_duplex::pcm::encode_frame;
/// let pcm = encode_frame(&[1.0, -1.0, 0.0]);
/// assert_eq!(pcm, vec![32767, -32768, 0]);
/// ```
pub fn encode_frame(frame: &[f32]) -> Vec<SampleI16> {
    frame.iter().map(|&s| encode_sample(s)).collect()
}

/// 16bit PCM をリトルエンディアンのバイト列に詰める
pub fn to_le_bytes(samples: &[SampleI16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}
