#![forbid(unsafe_code)]

// Configuration for the mediasoup worker, router, and transports

use mediasoup::prelude::*;
use mediasoup::worker::{WorkerLogLevel, WorkerLogTag};
use std::net::{IpAddr, Ipv4Addr};
use std::num::{NonZeroU32, NonZeroU8};

/// Main media engine configuration
#[derive(Debug, Clone)]
pub struct MediaConfig {
    pub worker_config: WorkerConfig,
    pub router_config: RouterConfig,
    pub webrtc_transport_config: WebRtcTransportConfig,
    pub plain_transport_config: PlainTransportConfig,
    /// Audio level observer reporting interval in ms
    pub observer_interval_ms: u16,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            worker_config: WorkerConfig::default(),
            router_config: RouterConfig::default(),
            webrtc_transport_config: WebRtcTransportConfig::default(),
            plain_transport_config: PlainTransportConfig::default(),
            observer_interval_ms: 500,
        }
    }
}

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub log_level: WorkerLogLevel,
    pub log_tags: Vec<WorkerLogTag>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            log_level: WorkerLogLevel::Warn,
            log_tags: vec![
                WorkerLogTag::Info,
                WorkerLogTag::Ice,
                WorkerLogTag::Dtls,
                WorkerLogTag::Rtp,
                WorkerLogTag::Srtp,
                WorkerLogTag::Rtcp,
            ],
            rtc_min_port: 40000,
            rtc_max_port: 49999,
        }
    }
}

impl WorkerConfig {
    /// Converts to mediasoup WorkerSettings
    pub fn to_worker_settings(&self) -> WorkerSettings {
        let mut settings = WorkerSettings::default();

        settings.log_level = self.log_level;
        settings.log_tags = self.log_tags.clone();
        settings.rtc_port_range = self.rtc_min_port..=self.rtc_max_port;

        settings
    }
}

/// Router configuration with codec capabilities
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub media_codecs: Vec<RtpCodecCapability>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            media_codecs: Self::default_codecs(),
        }
    }
}

impl RouterConfig {
    /// Opus, VP8 and two H264 profiles
    pub fn default_codecs() -> Vec<RtpCodecCapability> {
        let video_feedback = || {
            vec![
                RtcpFeedback::Nack,
                RtcpFeedback::NackPli,
                RtcpFeedback::CcmFir,
                RtcpFeedback::GoogRemb,
                RtcpFeedback::TransportCc,
            ]
        };

        let mut codecs = vec![
            RtpCodecCapability::Audio {
                mime_type: MimeTypeAudio::Opus,
                preferred_payload_type: None,
                clock_rate: NonZeroU32::new(48000).unwrap_or(NonZeroU32::MIN),
                channels: NonZeroU8::new(2).unwrap_or(NonZeroU8::MIN),
                parameters: RtpCodecParametersParameters::default(),
                rtcp_feedback: vec![RtcpFeedback::TransportCc],
            },
            RtpCodecCapability::Video {
                mime_type: MimeTypeVideo::Vp8,
                preferred_payload_type: None,
                clock_rate: NonZeroU32::new(90000).unwrap_or(NonZeroU32::MIN),
                parameters: RtpCodecParametersParameters::default(),
                rtcp_feedback: video_feedback(),
            },
        ];

        for profile in ["4d0032", "42e01f"] {
            codecs.push(RtpCodecCapability::Video {
                mime_type: MimeTypeVideo::H264,
                preferred_payload_type: None,
                clock_rate: NonZeroU32::new(90000).unwrap_or(NonZeroU32::MIN),
                parameters: RtpCodecParametersParameters::from([
                    ("packetization-mode", 1_u32.into()),
                    ("profile-level-id", profile.into()),
                    ("level-asymmetry-allowed", 1_u32.into()),
                ]),
                rtcp_feedback: video_feedback(),
            });
        }

        codecs
    }

    /// Converts to RouterOptions for mediasoup
    pub fn to_router_options(&self) -> RouterOptions {
        RouterOptions::new(self.media_codecs.clone())
    }

    /// Capabilities of a server-side receiver that accepts every router codec
    pub fn receiver_capabilities(&self) -> RtpCapabilities {
        RtpCapabilities {
            codecs: self.media_codecs.clone(),
            header_extensions: vec![],
        }
    }
}

/// WebRTC transport configuration
#[derive(Debug, Clone)]
pub struct WebRtcTransportConfig {
    pub listen_ip: IpAddr,
    pub announced_address: Option<String>,
    pub initial_available_outgoing_bitrate: u32,
    pub max_incoming_bitrate: Option<u32>,
    pub enable_tcp: bool,
}

impl Default for WebRtcTransportConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            announced_address: Some("127.0.0.1".to_string()),
            initial_available_outgoing_bitrate: 800_000,
            max_incoming_bitrate: Some(1_500_000),
            enable_tcp: true,
        }
    }
}

impl WebRtcTransportConfig {
    /// Sets the public IP address for the transport
    pub fn with_public_ip(mut self, public_ip: IpAddr) -> Self {
        self.announced_address = Some(public_ip.to_string());
        self
    }

    fn listen_info(&self, protocol: Protocol) -> ListenInfo {
        ListenInfo {
            protocol,
            ip: self.listen_ip,
            announced_address: self.announced_address.clone(),
            port: None,
            port_range: None,
            flags: None,
            send_buffer_size: None,
            recv_buffer_size: None,
            expose_internal_ip: false,
        }
    }

    /// Converts to WebRtcTransportOptions; UDP is listed first so it is preferred
    pub fn to_transport_options(&self) -> WebRtcTransportOptions {
        let mut listen_infos = WebRtcTransportListenInfos::new(self.listen_info(Protocol::Udp));
        if self.enable_tcp {
            listen_infos = listen_infos.insert(self.listen_info(Protocol::Tcp));
        }
        let mut options = WebRtcTransportOptions::new(listen_infos);
        options.initial_available_outgoing_bitrate = self.initial_available_outgoing_bitrate;
        options
    }
}

/// Plain RTP transport configuration for the recording path
#[derive(Debug, Clone)]
pub struct PlainTransportConfig {
    pub listen_ip: IpAddr,
}

impl Default for PlainTransportConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }
}

impl PlainTransportConfig {
    pub fn to_transport_options(&self) -> PlainTransportOptions {
        let mut options = PlainTransportOptions::new(ListenInfo {
            protocol: Protocol::Udp,
            ip: self.listen_ip,
            announced_address: None,
            port: None,
            port_range: None,
            flags: None,
            send_buffer_size: None,
            recv_buffer_size: None,
            expose_internal_ip: false,
        });
        options.rtcp_mux = true;
        options.comedia = false;
        options
    }
}
