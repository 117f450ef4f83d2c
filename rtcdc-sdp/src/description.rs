use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};
use shared::error::{Error, Result};

use crate::candidate::Candidate;
use crate::media::{Application, Entry, Media, MediaKind, SectionContext};
use crate::sdp_type::SdpType;

/// DTLS role declaration (`a=setup`), per RFC 4145/5763.
#[derive(Default, Debug, Copy, Clone, Eq, PartialEq)]
pub enum Setup {
    /// Offerer default: either role, peer picks.
    #[default]
    ActPass,
    /// We initiate the DTLS handshake (client).
    Active,
    /// We await the DTLS handshake (server).
    Passive,
}

impl fmt::Display for Setup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Setup::ActPass => "actpass",
            Setup::Active => "active",
            Setup::Passive => "passive",
        })
    }
}

impl FromStr for Setup {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "actpass" => Ok(Setup::ActPass),
            "active" => Ok(Setup::Active),
            "passive" => Ok(Setup::Passive),
            _ => Err(Error::ErrSdpInvalidLine(s.to_owned())),
        }
    }
}

/// A certificate fingerprint (`a=fingerprint`), colon-separated uppercase hex.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Fingerprint {
    pub algorithm: String,
    pub value: String,
}

impl Fingerprint {
    pub fn new(algorithm: impl Into<String>, value: impl Into<String>) -> Self {
        Fingerprint {
            algorithm: algorithm.into(),
            value: value.into(),
        }
    }

    /// Checks the colon-hex shape of the fingerprint value.
    pub fn is_valid(&self) -> bool {
        !self.value.is_empty()
            && self.value.split(':').all(|byte| {
                byte.len() == 2 && byte.chars().all(|c| c.is_ascii_hexdigit())
            })
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.algorithm, self.value)
    }
}

impl FromStr for Fingerprint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (algorithm, value) = s
            .split_once(' ')
            .ok_or(Error::ErrSdpInvalidFingerprint)?;
        Ok(Fingerprint::new(algorithm, value.trim()))
    }
}

/// A complete session description: ordered media sections plus session-level
/// ICE credentials, fingerprint, and bundle group.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Description {
    pub sdp_type: SdpType,
    pub session_id: String,
    pub ice_ufrag: Option<String>,
    pub ice_pwd: Option<String>,
    pub ice_options: Option<String>,
    pub fingerprint: Option<Fingerprint>,
    pub setup: Setup,
    pub entries: Vec<Entry>,
}

impl Default for Description {
    fn default() -> Self {
        Description::new(SdpType::Offer)
    }
}

impl Description {
    pub fn new(sdp_type: SdpType) -> Self {
        let session_id = rand::rng().random_range(1_000_000_000u64..10_000_000_000u64);
        Description {
            sdp_type,
            session_id: session_id.to_string(),
            ice_ufrag: None,
            ice_pwd: None,
            ice_options: Some("trickle".to_owned()),
            fingerprint: None,
            setup: Setup::ActPass,
            entries: Vec::new(),
        }
    }

    /// Parses an SDP string. Accepts `\n` or `\r\n` line endings.
    pub fn parse(sdp: &str, sdp_type: SdpType) -> Result<Self> {
        let mut desc = Description {
            sdp_type,
            session_id: String::new(),
            ice_ufrag: None,
            ice_pwd: None,
            ice_options: None,
            fingerprint: None,
            setup: Setup::ActPass,
            entries: Vec::new(),
        };
        let mut current: Option<Entry> = None;
        let mut bundle: Vec<String> = Vec::new();

        for raw in sdp.lines() {
            let line = raw.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            if let Some(mline) = line.strip_prefix("m=") {
                if let Some(entry) = current.take() {
                    desc.entries.push(finish_entry(entry));
                }
                current = Some(Self::parse_mline(mline)?);
            } else if let Some(attr) = line.strip_prefix("a=") {
                desc.parse_attribute(attr, &mut current, &mut bundle)?;
            } else if let Some(origin) = line.strip_prefix("o=") {
                if let Some(session_id) = origin.split_whitespace().nth(1) {
                    desc.session_id = session_id.to_owned();
                }
            }
            // v=, s=, t=, c=, b= carry placeholders and are ignored
        }
        if let Some(entry) = current.take() {
            desc.entries.push(finish_entry(entry));
        }

        desc.check(&bundle)?;
        Ok(desc)
    }

    fn parse_mline(mline: &str) -> Result<Entry> {
        let mut tokens = mline.split_whitespace();
        let media = tokens
            .next()
            .ok_or_else(|| Error::ErrSdpInvalidLine(mline.to_owned()))?;
        // skip port and protocol
        let _port = tokens.next();
        let _proto = tokens.next();
        match media {
            "application" => Ok(Entry::Application(Application::default())),
            _ => {
                let kind: MediaKind = media.parse()?;
                let mut section = Media {
                    kind,
                    ..Default::default()
                };
                let formats = tokens.collect::<Vec<_>>().join(" ");
                // a datagram format token such as webrtc-datachannel is not a payload list
                if formats.split_whitespace().all(|t| t.parse::<u8>().is_ok()) {
                    section.parse_mline(&formats)?;
                }
                Ok(Entry::Media(section))
            }
        }
    }

    fn parse_attribute(
        &mut self,
        attr: &str,
        current: &mut Option<Entry>,
        bundle: &mut Vec<String>,
    ) -> Result<()> {
        let (key, value) = match attr.split_once(':') {
            Some((key, value)) => (key, value),
            None => (attr, ""),
        };
        match key {
            // session-scope values may also appear under an m-line; last wins
            "ice-ufrag" => self.ice_ufrag = Some(value.to_owned()),
            "ice-pwd" => self.ice_pwd = Some(value.to_owned()),
            "ice-options" => self.ice_options = Some(value.to_owned()),
            "fingerprint" => self.fingerprint = Some(value.parse()?),
            "setup" => self.setup = value.parse()?,
            "group" => {
                let mut tokens = value.split_whitespace();
                if tokens.next() == Some("BUNDLE") {
                    *bundle = tokens.map(str::to_owned).collect();
                }
            }
            _ => {
                if let Some(entry) = current.as_mut() {
                    entry.parse_attribute(attr)?;
                }
            }
        }
        Ok(())
    }

    /// Enforces the structural invariants: unique mids, at most one
    /// application section, bundle references existing mids, each SSRC
    /// declared in exactly one media section.
    fn check(&self, bundle: &[String]) -> Result<()> {
        let mut mids = HashSet::new();
        for entry in &self.entries {
            if !mids.insert(entry.mid().to_owned()) {
                return Err(Error::ErrSdpDuplicateMid);
            }
        }
        for mid in bundle {
            if !mids.contains(mid) {
                return Err(Error::ErrSdpBundleUnknownMid);
            }
        }
        if self.entries.iter().filter(|e| e.is_application()).count() > 1 {
            return Err(Error::ErrSdpMultipleApplication);
        }
        let mut ssrcs = HashSet::new();
        for entry in &self.entries {
            if let Entry::Media(media) = entry {
                for ssrc in media.ssrc_ids() {
                    if !ssrcs.insert(ssrc) {
                        return Err(Error::ErrSdpDuplicateSsrc);
                    }
                }
            }
        }
        Ok(())
    }

    /// Renders the description with `\r\n` line endings.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(1024);
        out.push_str("v=0\r\n");
        out.push_str(&format!("o=rtc {} 0 IN IP4 127.0.0.1\r\n", self.session_id));
        out.push_str("s=-\r\n");
        out.push_str("t=0 0\r\n");
        if !self.entries.is_empty() {
            let mids = self
                .entries
                .iter()
                .map(Entry::mid)
                .collect::<Vec<_>>()
                .join(" ");
            out.push_str(&format!("a=group:BUNDLE {mids}\r\n"));
        }
        if let Some(options) = &self.ice_options {
            out.push_str(&format!("a=ice-options:{options}\r\n"));
        }
        let session = SectionContext {
            setup: Some(match self.setup {
                Setup::ActPass => "actpass",
                Setup::Active => "active",
                Setup::Passive => "passive",
            }),
            ice_ufrag: self.ice_ufrag.as_deref(),
            ice_pwd: self.ice_pwd.as_deref(),
            fingerprint: self.fingerprint.as_ref().map(Fingerprint::to_string),
        };
        for entry in &self.entries {
            entry.render(&mut out, &session);
        }
        out
    }

    pub fn application(&self) -> Option<&Application> {
        self.entries.iter().find_map(|e| match e {
            Entry::Application(app) => Some(app),
            _ => None,
        })
    }

    pub fn media_sections(&self) -> impl Iterator<Item = &Media> {
        self.entries.iter().filter_map(|e| match e {
            Entry::Media(media) => Some(media),
            _ => None,
        })
    }

    pub fn has_mid(&self, mid: &str) -> bool {
        self.entries.iter().any(|e| e.mid() == mid)
    }

    pub fn entry(&self, mid: &str) -> Option<&Entry> {
        self.entries.iter().find(|e| e.mid() == mid)
    }

    pub fn entry_mut(&mut self, mid: &str) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|e| e.mid() == mid)
    }

    pub fn add_application(&mut self, app: Application) {
        self.entries.push(Entry::Application(app));
    }

    pub fn add_media(&mut self, media: Media) {
        self.entries.push(Entry::Media(media));
    }

    /// Attaches a candidate to the entry named by its mid hint, or to the
    /// first entry when no hint is present (all mids share one flow under
    /// bundle).
    pub fn add_candidate(&mut self, candidate: Candidate) {
        let entry = match &candidate.mid {
            Some(mid) => self.entry_mut(mid.as_str()),
            None => self.entries.first_mut(),
        };
        if let Some(entry) = entry {
            entry.add_candidate(candidate);
        }
    }

    pub fn set_end_of_candidates(&mut self) {
        for entry in &mut self.entries {
            entry.set_end_of_candidates();
        }
    }

    /// Whether at least one m-line is active (not `inactive`).
    pub fn has_active_media(&self) -> bool {
        self.entries
            .iter()
            .any(|e| e.direction() != crate::direction::Direction::Inactive)
    }
}

impl fmt::Display for Description {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

fn finish_entry(mut entry: Entry) -> Entry {
    if let Entry::Media(media) = &mut entry {
        media.strip_placeholder_format();
    }
    entry
}

/// The `{type, sdp}` JSON shape used by browser signaling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl From<&Description> for SignalingDescription {
    fn from(desc: &Description) -> Self {
        SignalingDescription {
            sdp_type: desc.sdp_type,
            sdp: desc.render(),
        }
    }
}

impl TryFrom<SignalingDescription> for Description {
    type Error = Error;

    fn try_from(value: SignalingDescription) -> Result<Self> {
        Description::parse(&value.sdp, value.sdp_type)
    }
}
