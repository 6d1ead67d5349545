//! WFD IE subelements and RTSP parameter tables.

use miracle_shared::{parse, CoreError};

/// Subelement id of the device information block.
const SUBELEM_DEVICE_INFO: u8 = 0;

/// Device type bits of the device-information field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Source,
    PrimarySink,
    SecondarySink,
    DualRole,
}

/// The device-information subelement of a peer's WFD IE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub info: u16,
    pub ctrl_port: u16,
    pub max_throughput: u16,
}

fn hex_nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    let s = s.as_bytes();
    if s.len() % 2 != 0 {
        return None;
    }
    s.chunks_exact(2)
        .map(|p| Some(hex_nibble(p[0])? << 4 | hex_nibble(p[1])?))
        .collect()
}

impl DeviceInfo {
    /// Parse the subelement blob wpa_supplicant reports for a peer
    /// (`wfd_subelems`, hex encoded) and pull out the device info.
    pub fn from_subelems_hex(hex: &str) -> Result<Self, CoreError> {
        let data =
            decode_hex(hex.trim()).ok_or_else(|| CoreError::protocol("bad WFD subelement hex"))?;
        let mut pos = 0;
        while pos + 3 <= data.len() {
            let id = data[pos];
            let len = usize::from(u16::from_be_bytes([data[pos + 1], data[pos + 2]]));
            let body = data
                .get(pos + 3..pos + 3 + len)
                .ok_or_else(|| CoreError::protocol("truncated WFD subelement"))?;
            if id == SUBELEM_DEVICE_INFO {
                if body.len() < 6 {
                    return Err(CoreError::protocol("short device-info subelement"));
                }
                return Ok(Self {
                    info: u16::from_be_bytes([body[0], body[1]]),
                    ctrl_port: u16::from_be_bytes([body[2], body[3]]),
                    max_throughput: u16::from_be_bytes([body[4], body[5]]),
                });
            }
            pos += 3 + len;
        }
        Err(CoreError::protocol("no device-info subelement"))
    }

    pub fn device_type(&self) -> DeviceType {
        match self.info & 0x3 {
            0 => DeviceType::Source,
            1 => DeviceType::PrimarySink,
            2 => DeviceType::SecondarySink,
            _ => DeviceType::DualRole,
        }
    }

    pub fn is_sink(&self) -> bool {
        !matches!(self.device_type(), DeviceType::Source)
    }

    /// RTSP control port the peer listens on (7236 when unset).
    pub fn rtsp_port(&self) -> u16 {
        if self.ctrl_port == 0 {
            7236
        } else {
            self.ctrl_port
        }
    }
}

/// `wfd_video_formats` table: native resolution index and the H.264 codec
/// capability (profile, level and the three resolution bitmaps).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoFormats {
    pub native: u8,
    pub pref_disp_mode: u8,
    pub profile: u8,
    pub level: u8,
    pub cea: u32,
    pub vesa: u32,
    pub hh: u32,
}

/// What this source can encode.
pub const SUPPORTED_VIDEO: VideoFormats = VideoFormats {
    native: 0x00,
    pref_disp_mode: 0x00,
    profile: 0x02,
    level: 0x08,
    cea: 0x0001_ffff,
    vesa: 0x0000_0fff,
    hh: 0x0000_0fff,
};

impl VideoFormats {
    /// Parse the value of a `wfd_video_formats` parameter. Only the first
    /// H.264 codec block is used.
    pub fn from_param(value: &str) -> Result<Self, CoreError> {
        let mut it = value.split([' ', ',']).filter(|t| !t.is_empty());
        let mut next = |name: &str| -> Result<u64, CoreError> {
            let tok = it
                .next()
                .ok_or_else(|| CoreError::protocol(format!("wfd_video_formats missing {name}")))?;
            parse::atoi_u64(tok, 16)
                .map_err(|_| CoreError::protocol(format!("wfd_video_formats bad {name}: {tok}")))
        };
        Ok(Self {
            native: next("native")? as u8,
            pref_disp_mode: next("preferred-display-mode")? as u8,
            profile: next("profile")? as u8,
            level: next("level")? as u8,
            cea: next("cea")? as u32,
            vesa: next("vesa")? as u32,
            hh: next("hh")? as u32,
        })
    }

    /// Render as a `wfd_video_formats` value.
    pub fn to_param(&self) -> String {
        format!(
            "{:02x} {:02x} {:02x} {:02x} {:08x} {:08x} {:08x} 00 0000 0000 00 none none",
            self.native, self.pref_disp_mode, self.profile, self.level, self.cea, self.vesa,
            self.hh
        )
    }

    /// Intersect the sink's capabilities with ours.
    pub fn negotiate(&self, ours: &VideoFormats) -> VideoFormats {
        VideoFormats {
            native: self.native,
            pref_disp_mode: 0,
            profile: self.profile.min(ours.profile),
            level: self.level.min(ours.level),
            cea: self.cea & ours.cea,
            vesa: self.vesa & ours.vesa,
            hh: self.hh & ours.hh,
        }
    }
}

/// One codec entry of a `wfd_audio_codecs` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioCodec {
    pub name: String,
    pub modes: u32,
    pub latency: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AudioCodecs {
    pub codecs: Vec<AudioCodec>,
}

/// What this source can emit.
pub fn supported_audio() -> AudioCodecs {
    AudioCodecs {
        codecs: vec![
            AudioCodec {
                name: "LPCM".to_string(),
                modes: 0x0000_0003,
                latency: 0,
            },
            AudioCodec {
                name: "AAC".to_string(),
                modes: 0x0000_0001,
                latency: 0,
            },
        ],
    }
}

impl AudioCodecs {
    /// Parse a `wfd_audio_codecs` value: `NAME modes latency` triples
    /// separated by commas.
    pub fn from_param(value: &str) -> Result<Self, CoreError> {
        let mut codecs = Vec::new();
        for entry in value.split(',') {
            let mut it = entry.split(' ').filter(|t| !t.is_empty());
            let Some(name) = it.next() else {
                continue;
            };
            let modes = it
                .next()
                .and_then(|t| parse::atoi_u64(t, 16).ok())
                .ok_or_else(|| CoreError::protocol("wfd_audio_codecs missing modes"))?;
            let latency = it
                .next()
                .and_then(|t| parse::atoi_u64(t, 16).ok())
                .ok_or_else(|| CoreError::protocol("wfd_audio_codecs missing latency"))?;
            codecs.push(AudioCodec {
                name: name.to_string(),
                modes: modes as u32,
                latency: latency as u8,
            });
        }
        if codecs.is_empty() {
            return Err(CoreError::protocol("empty wfd_audio_codecs"));
        }
        Ok(Self { codecs })
    }

    pub fn to_param(&self) -> String {
        self.codecs
            .iter()
            .map(|c| format!("{} {:08x} {:02x}", c.name, c.modes, c.latency))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Keep the codecs both ends support, with intersected mode bits.
    pub fn negotiate(&self, ours: &AudioCodecs) -> AudioCodecs {
        let codecs = self
            .codecs
            .iter()
            .filter_map(|sink| {
                let our = ours.codecs.iter().find(|c| c.name == sink.name)?;
                let modes = sink.modes & our.modes;
                (modes != 0).then(|| AudioCodec {
                    name: sink.name.clone(),
                    modes,
                    latency: sink.latency.max(our.latency),
                })
            })
            .collect();
        AudioCodecs { codecs }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_info_from_subelems() {
        // device info subelement: id 0, len 6, info 0x0111, port 0x1c44 (7236)
        let info = DeviceInfo::from_subelems_hex("00000601111c440050").unwrap();
        assert_eq!(info.info, 0x0111);
        assert_eq!(info.ctrl_port, 7236);
        assert_eq!(info.rtsp_port(), 7236);
        assert_eq!(info.device_type(), DeviceType::PrimarySink);
        assert!(info.is_sink());
    }

    #[test]
    fn source_is_not_a_sink() {
        let info = DeviceInfo {
            info: 0x0110,
            ctrl_port: 0,
            max_throughput: 0,
        };
        assert_eq!(info.device_type(), DeviceType::Source);
        assert!(!info.is_sink());
        assert_eq!(info.rtsp_port(), 7236);
    }

    #[test]
    fn skips_foreign_subelements() {
        // coupled-sink (id 6) first, then device info
        let hex = "060002aabb00000602221c440050";
        let info = DeviceInfo::from_subelems_hex(hex).unwrap();
        assert_eq!(info.info, 0x0222);
        assert_eq!(info.device_type(), DeviceType::SecondarySink);
    }

    #[test]
    fn rejects_blob_without_device_info() {
        assert!(DeviceInfo::from_subelems_hex("060002aabb").is_err());
        assert!(DeviceInfo::from_subelems_hex("zz").is_err());
    }

    #[test]
    fn video_formats_round_trip() {
        let v = VideoFormats::from_param("40 00 02 10 0001ffff 00000fff 00000fff 00 0000 0000 00 none none").unwrap();
        assert_eq!(v.native, 0x40);
        assert_eq!(v.profile, 0x02);
        assert_eq!(v.cea, 0x0001_ffff);
        let rendered = v.to_param();
        let v2 = VideoFormats::from_param(&rendered).unwrap();
        assert_eq!(v, v2);
    }

    #[test]
    fn video_negotiation_intersects() {
        let sink = VideoFormats {
            native: 0x40,
            pref_disp_mode: 0,
            profile: 0x01,
            level: 0x10,
            cea: 0x0101,
            vesa: 0xffff,
            hh: 0,
        };
        let n = sink.negotiate(&SUPPORTED_VIDEO);
        assert_eq!(n.profile, 0x01);
        assert_eq!(n.level, 0x08);
        assert_eq!(n.cea, 0x0101 & SUPPORTED_VIDEO.cea);
        assert_eq!(n.hh, 0);
    }

    #[test]
    fn audio_codecs_parse_and_negotiate() {
        let sink = AudioCodecs::from_param("LPCM 00000003 00, AAC 00000007 00").unwrap();
        assert_eq!(sink.codecs.len(), 2);
        let n = sink.negotiate(&supported_audio());
        assert_eq!(n.codecs.len(), 2);
        assert_eq!(n.codecs[1].name, "AAC");
        assert_eq!(n.codecs[1].modes, 0x1);
        assert!(n.to_param().starts_with("LPCM 00000003 00"));
    }

    #[test]
    fn audio_negotiation_drops_unsupported() {
        let sink = AudioCodecs::from_param("AC3 00000007 00").unwrap();
        let n = sink.negotiate(&supported_audio());
        assert!(n.codecs.is_empty());
    }
}
