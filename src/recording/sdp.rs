#![forbid(unsafe_code)]

// Session description handed to the encoder

use crate::media::CodecInfo;
use std::net::IpAddr;

/// Builds a receive-only audio SDP for one RTP stream arriving at `ip:port`
pub fn audio_sdp(ip: IpAddr, port: u16, codec: &CodecInfo) -> String {
    let pt = codec.payload_type;
    [
        "v=0".to_string(),
        "o=- 0 0 IN IP4 0.0.0.0".to_string(),
        "s=MediaSoup Recording".to_string(),
        format!("c=IN IP4 {}", ip),
        "t=0 0".to_string(),
        format!("m=audio {} RTP/AVP {}", port, pt),
        format!(
            "a=rtpmap:{} {}/{}/{}",
            pt, codec.codec_name, codec.clock_rate, codec.channels
        ),
        "a=recvonly".to_string(),
        String::new(),
    ]
    .join("\n")
}
