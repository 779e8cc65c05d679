//! Configuration types for the DIMSE storage listener

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::association::VERIFICATION_SOP_CLASS;
use crate::DEFAULT_DIMSE_PORT;

/// Configuration for the DIMSE storage listener
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimseConfig {
    /// Primary Application Entity Title
    pub local_aet: String,

    /// Additional AE titles answered on the same port with the same capabilities
    #[serde(default)]
    pub alternative_aets: Vec<String>,

    /// Bind address for SCP listener
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,

    /// Port for SCP listener
    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum PDU length we accept from peers, in bytes
    #[serde(default = "default_max_pdu")]
    pub max_pdu_receive: u32,

    /// Maximum PDU length we emit, in bytes
    #[serde(default = "default_max_pdu")]
    pub max_pdu_send: u32,

    /// Time allowed for association negotiation after the TCP accept
    #[serde(default = "default_accept_timeout")]
    pub accept_timeout_ms: u64,

    /// Time allowed for outbound connects (readiness check)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Maximum silence between two requests on an active association
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,

    /// Time allowed to write a response back to the peer, 0 for no limit
    #[serde(default = "default_response_timeout")]
    pub response_timeout_ms: u64,

    /// Time given to active associations to finish once shutdown starts
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_ms: u64,

    /// Maximum number of concurrent associations
    #[serde(default = "default_max_associations")]
    pub max_associations: u32,

    /// Storage SOP classes accepted (Verification is always added)
    #[serde(default = "default_storage_sop_classes")]
    pub storage_sop_classes: Vec<String>,

    /// Transfer syntaxes accepted for every abstract syntax
    #[serde(default = "default_transfer_syntaxes")]
    pub transfer_syntaxes: Vec<String>,

    /// Accept any abstract syntax proposed by the peer
    #[serde(default)]
    pub promiscuous: bool,
}

impl Default for DimseConfig {
    fn default() -> Self {
        Self {
            local_aet: "ARCHIVIST".to_string(),
            alternative_aets: Vec::new(),
            bind_addr: default_bind_addr(),
            port: default_port(),
            max_pdu_receive: default_max_pdu(),
            max_pdu_send: default_max_pdu(),
            accept_timeout_ms: default_accept_timeout(),
            connect_timeout_ms: default_connect_timeout(),
            idle_timeout_ms: default_idle_timeout(),
            response_timeout_ms: default_response_timeout(),
            drain_timeout_ms: default_drain_timeout(),
            max_associations: default_max_associations(),
            storage_sop_classes: default_storage_sop_classes(),
            transfer_syntaxes: default_transfer_syntaxes(),
            promiscuous: false,
        }
    }
}

impl DimseConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }

    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// All AE titles this listener answers to, primary first, without duplicates
    pub fn ae_titles(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        std::iter::once(&self.local_aet)
            .chain(self.alternative_aets.iter())
            .map(|aet| aet.trim().to_string())
            .filter(|aet| seen.insert(aet.clone()))
            .collect()
    }

    /// Abstract syntaxes advertised during negotiation, Verification first
    pub fn abstract_syntaxes(&self) -> Vec<String> {
        let mut syntaxes = vec![VERIFICATION_SOP_CLASS.to_string()];
        for uid in &self.storage_sop_classes {
            if !syntaxes.iter().any(|s| s == uid) {
                syntaxes.push(uid.clone());
            }
        }
        syntaxes
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::error::Result<()> {
        for aet in self.ae_titles() {
            if aet.is_empty() || aet.len() > 16 {
                return Err(crate::error::DimseError::InvalidAeTitle(format!(
                    "'{}' must be 1-16 characters",
                    aet
                )));
            }
        }

        if self.max_pdu_receive < 4096 || self.max_pdu_receive > 131_072 {
            return Err(crate::error::DimseError::config(
                "max_pdu_receive must be between 4096 and 131072 bytes",
            ));
        }

        if self.max_pdu_send < 4096 || self.max_pdu_send > 131_072 {
            return Err(crate::error::DimseError::config(
                "max_pdu_send must be between 4096 and 131072 bytes",
            ));
        }

        if self.max_associations == 0 {
            return Err(crate::error::DimseError::config(
                "max_associations must be greater than 0",
            ));
        }

        if self.transfer_syntaxes.is_empty() {
            return Err(crate::error::DimseError::config(
                "At least one transfer syntax must be accepted",
            ));
        }

        if self.idle_timeout_ms == 0 || self.accept_timeout_ms == 0 {
            return Err(crate::error::DimseError::config(
                "Accept and idle timeouts must be greater than 0",
            ));
        }

        Ok(())
    }
}

// Default value functions
fn default_bind_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0))
}

fn default_port() -> u16 {
    DEFAULT_DIMSE_PORT
}

fn default_max_pdu() -> u32 {
    16_384 + 1_000
}

fn default_accept_timeout() -> u64 {
    5_000
}

fn default_connect_timeout() -> u64 {
    5_000
}

fn default_idle_timeout() -> u64 {
    18_000_000 // 5 hours
}

fn default_response_timeout() -> u64 {
    18_000_000
}

fn default_drain_timeout() -> u64 {
    30_000
}

fn default_max_associations() -> u32 {
    50
}

fn default_storage_sop_classes() -> Vec<String> {
    [
        "1.2.840.10008.5.1.4.1.1.1",     // Computed Radiography Image Storage
        "1.2.840.10008.5.1.4.1.1.1.1",   // Digital X-Ray Image Storage - For Presentation
        "1.2.840.10008.5.1.4.1.1.1.2",   // Digital Mammography X-Ray Image Storage - For Presentation
        "1.2.840.10008.5.1.4.1.1.2",     // CT Image Storage
        "1.2.840.10008.5.1.4.1.1.2.1",   // Enhanced CT Image Storage
        "1.2.840.10008.5.1.4.1.1.3.1",   // Ultrasound Multi-frame Image Storage
        "1.2.840.10008.5.1.4.1.1.4",     // MR Image Storage
        "1.2.840.10008.5.1.4.1.1.4.1",   // Enhanced MR Image Storage
        "1.2.840.10008.5.1.4.1.1.6.1",   // Ultrasound Image Storage
        "1.2.840.10008.5.1.4.1.1.7",     // Secondary Capture Image Storage
        "1.2.840.10008.5.1.4.1.1.20",    // Nuclear Medicine Image Storage
        "1.2.840.10008.5.1.4.1.1.77.1.6", // VL Whole Slide Microscopy Image Storage
        "1.2.840.10008.5.1.4.1.1.88.11", // Basic Text SR Storage
        "1.2.840.10008.5.1.4.1.1.128",   // PET Image Storage
    ]
    .iter()
    .map(|uid| uid.to_string())
    .collect()
}

fn default_transfer_syntaxes() -> Vec<String> {
    vec![
        "1.2.840.10008.1.2".to_string(),      // Implicit VR Little Endian
        "1.2.840.10008.1.2.1".to_string(),    // Explicit VR Little Endian
        "1.2.840.10008.1.2.2".to_string(),    // Explicit VR Big Endian
        "1.2.840.10008.1.2.4.50".to_string(), // JPEG Baseline
        "1.2.840.10008.1.2.4.70".to_string(), // JPEG Lossless
        "1.2.840.10008.1.2.4.90".to_string(), // JPEG 2000 Lossless
        "1.2.840.10008.1.2.4.91".to_string(), // JPEG 2000
        "1.2.840.10008.1.2.5".to_string(),    // RLE Lossless
    ]
}
