use std::fmt;
use std::str::FromStr;

use shared::error::{Error, Result};

use crate::candidate::Candidate;
use crate::direction::Direction;

/// Media kind of a non-application m-line.
#[derive(Default, Debug, Copy, Clone, Eq, PartialEq)]
pub enum MediaKind {
    #[default]
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        })
    }
}

impl FromStr for MediaKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "audio" => Ok(MediaKind::Audio),
            "video" => Ok(MediaKind::Video),
            _ => Err(Error::ErrSdpInvalidLine(s.to_owned())),
        }
    }
}

/// A mapped RTP payload type (`a=rtpmap` plus its `a=fmtp`/`a=rtcp-fb`).
#[derive(Default, Debug, Clone, Eq, PartialEq)]
pub struct PayloadType {
    pub codec: String,
    pub clock_rate: u32,
    pub channels: Option<u16>,
    pub fmtps: Vec<String>,
    pub rtcp_fbs: Vec<String>,
}

impl PayloadType {
    /// `a=rtpmap` encoding, e.g. `opus/48000/2`.
    pub fn rtpmap_value(&self) -> String {
        match self.channels {
            Some(ch) => format!("{}/{}/{}", self.codec, self.clock_rate, ch),
            None => format!("{}/{}", self.codec, self.clock_rate),
        }
    }
}

/// A declared synchronization source with its source attributes.
#[derive(Default, Debug, Clone, Eq, PartialEq)]
pub struct Ssrc {
    pub ssrc: u32,
    pub cname: Option<String>,
    pub msid: Option<String>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RidDirection {
    Send,
    Recv,
}

impl fmt::Display for RidDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RidDirection::Send => "send",
            RidDirection::Recv => "recv",
        })
    }
}

/// A simulcast restriction identifier (`a=rid`).
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Rid {
    pub id: String,
    pub direction: RidDirection,
    /// Raw restriction list, e.g. `pt=96;max-width=1280`. Empty if absent.
    pub constraints: String,
}

/// The `m=application` data section.
#[derive(Default, Debug, Clone, Eq, PartialEq)]
pub struct Application {
    pub mid: String,
    pub direction: Direction,
    pub sctp_port: Option<u16>,
    pub max_message_size: Option<usize>,
    pub candidates: Vec<Candidate>,
    pub end_of_candidates: bool,
    /// Attributes we do not model, preserved verbatim (without `a=`).
    pub extra_attributes: Vec<String>,
}

impl Application {
    pub fn new(mid: impl Into<String>) -> Self {
        Application {
            mid: mid.into(),
            ..Default::default()
        }
    }

    pub(crate) fn parse_attribute(&mut self, attr: &str) -> Result<()> {
        let (key, value) = split_attribute(attr);
        match key {
            "mid" => self.mid = value.to_owned(),
            "sctp-port" => self.sctp_port = Some(value.parse()?),
            "max-message-size" => self.max_message_size = Some(value.parse()?),
            // old-style sctpmap carries the port as its first token
            "sctpmap" => {
                if let Some(port) = value.split_whitespace().next() {
                    self.sctp_port = Some(port.parse()?);
                }
            }
            "candidate" => self.candidates.push(value.parse()?),
            "end-of-candidates" => self.end_of_candidates = true,
            "sendrecv" | "sendonly" | "recvonly" | "inactive" => self.direction = key.parse()?,
            _ => self.extra_attributes.push(attr.to_owned()),
        }
        Ok(())
    }

    pub(crate) fn render(&self, out: &mut String, session: &SectionContext<'_>) {
        out.push_str("m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n");
        out.push_str("c=IN IP4 0.0.0.0\r\n");
        push_attr(out, &format!("mid:{}", self.mid));
        push_attr(out, &self.direction.to_string());
        session.render(out);
        if let Some(port) = self.sctp_port {
            push_attr(out, &format!("sctp-port:{port}"));
        }
        if let Some(mms) = self.max_message_size {
            push_attr(out, &format!("max-message-size:{mms}"));
        }
        for attr in &self.extra_attributes {
            push_attr(out, attr);
        }
        render_candidates(out, &self.candidates, self.end_of_candidates);
    }
}

/// An audio or video m-line.
#[derive(Default, Debug, Clone, Eq, PartialEq)]
pub struct Media {
    pub kind: MediaKind,
    pub mid: String,
    pub direction: Direction,
    pub rtcp_mux: bool,
    /// Payload types in m-line order.
    pub payload_order: Vec<u8>,
    pub payload_types: std::collections::BTreeMap<u8, PayloadType>,
    pub ssrcs: Vec<Ssrc>,
    pub ssrc_groups: Vec<(String, Vec<u32>)>,
    /// Header extensions in declaration order, id to uri.
    pub extmaps: Vec<(u8, String)>,
    pub rids: Vec<Rid>,
    /// Raw `a=simulcast` value, e.g. `send hi;lo`.
    pub simulcast: Option<String>,
    pub candidates: Vec<Candidate>,
    pub end_of_candidates: bool,
    pub extra_attributes: Vec<String>,
}

impl Media {
    pub fn new(kind: MediaKind, mid: impl Into<String>) -> Self {
        Media {
            kind,
            mid: mid.into(),
            rtcp_mux: true,
            ..Default::default()
        }
    }

    pub fn add_payload_type(&mut self, pt: u8, payload: PayloadType) {
        if !self.payload_order.contains(&pt) {
            self.payload_order.push(pt);
        }
        self.payload_types.insert(pt, payload);
    }

    pub fn add_ssrc(&mut self, ssrc: Ssrc) {
        self.ssrcs.push(ssrc);
    }

    pub fn ssrc_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.ssrcs.iter().map(|s| s.ssrc)
    }

    pub fn has_ssrc(&self, ssrc: u32) -> bool {
        self.ssrcs.iter().any(|s| s.ssrc == ssrc)
    }

    pub(crate) fn parse_mline(&mut self, formats: &str) -> Result<()> {
        for pt in formats.split_whitespace() {
            let pt: u8 = pt.parse()?;
            if !self.payload_order.contains(&pt) {
                self.payload_order.push(pt);
                self.payload_types.insert(pt, PayloadType::default());
            }
        }
        Ok(())
    }

    /// A lone format `0` that no rtpmap ever described is the placeholder
    /// emitted for a payload-less section; drop it once the section is
    /// complete so such descriptions round-trip.
    pub(crate) fn strip_placeholder_format(&mut self) {
        if self.payload_order == [0]
            && self
                .payload_types
                .get(&0)
                .is_some_and(|payload| *payload == PayloadType::default())
        {
            self.payload_order.clear();
            self.payload_types.clear();
        }
    }

    pub(crate) fn parse_attribute(&mut self, attr: &str) -> Result<()> {
        let (key, value) = split_attribute(attr);
        match key {
            "mid" => self.mid = value.to_owned(),
            "rtcp-mux" => self.rtcp_mux = true,
            "sendrecv" | "sendonly" | "recvonly" | "inactive" => self.direction = key.parse()?,
            "rtpmap" => {
                let (pt, map) = value
                    .split_once(' ')
                    .ok_or_else(|| Error::ErrSdpInvalidLine(attr.to_owned()))?;
                let pt: u8 = pt.parse()?;
                let mut parts = map.split('/');
                let codec = parts
                    .next()
                    .ok_or_else(|| Error::ErrSdpInvalidLine(attr.to_owned()))?
                    .to_owned();
                let clock_rate = parts
                    .next()
                    .ok_or_else(|| Error::ErrSdpInvalidLine(attr.to_owned()))?
                    .parse()?;
                let channels = parts.next().map(str::parse).transpose()?;
                let entry = self.payload_types.entry(pt).or_default();
                entry.codec = codec;
                entry.clock_rate = clock_rate;
                entry.channels = channels;
                if !self.payload_order.contains(&pt) {
                    self.payload_order.push(pt);
                }
            }
            "fmtp" => {
                let (pt, params) = value
                    .split_once(' ')
                    .ok_or_else(|| Error::ErrSdpInvalidLine(attr.to_owned()))?;
                let pt: u8 = pt.parse()?;
                self.payload_types
                    .entry(pt)
                    .or_default()
                    .fmtps
                    .push(params.to_owned());
            }
            "rtcp-fb" => {
                let (pt, fb) = value
                    .split_once(' ')
                    .ok_or_else(|| Error::ErrSdpInvalidLine(attr.to_owned()))?;
                if pt == "*" {
                    for payload in self.payload_types.values_mut() {
                        payload.rtcp_fbs.push(fb.to_owned());
                    }
                } else {
                    self.payload_types
                        .entry(pt.parse()?)
                        .or_default()
                        .rtcp_fbs
                        .push(fb.to_owned());
                }
            }
            "extmap" => {
                let (id, uri) = value
                    .split_once(' ')
                    .ok_or_else(|| Error::ErrSdpInvalidLine(attr.to_owned()))?;
                // direction suffixes like "1/recvonly" are not modeled
                let id = id.split('/').next().unwrap_or(id);
                self.extmaps.push((id.parse()?, uri.to_owned()));
            }
            "ssrc" => {
                let (ssrc, rest) = match value.split_once(' ') {
                    Some((ssrc, rest)) => (ssrc, Some(rest)),
                    None => (value, None),
                };
                let ssrc: u32 = ssrc.parse()?;
                let entry = match self.ssrcs.iter_mut().find(|s| s.ssrc == ssrc) {
                    Some(entry) => entry,
                    None => {
                        self.ssrcs.push(Ssrc {
                            ssrc,
                            ..Default::default()
                        });
                        self.ssrcs.last_mut().unwrap()
                    }
                };
                if let Some(rest) = rest {
                    if let Some(cname) = rest.strip_prefix("cname:") {
                        entry.cname = Some(cname.to_owned());
                    } else if let Some(msid) = rest.strip_prefix("msid:") {
                        entry.msid = Some(msid.to_owned());
                    }
                }
            }
            "ssrc-group" => {
                let mut tokens = value.split_whitespace();
                let semantics = tokens
                    .next()
                    .ok_or_else(|| Error::ErrSdpInvalidLine(attr.to_owned()))?
                    .to_owned();
                let ssrcs = tokens
                    .map(str::parse)
                    .collect::<std::result::Result<Vec<u32>, _>>()?;
                self.ssrc_groups.push((semantics, ssrcs));
            }
            "rid" => {
                let mut tokens = value.splitn(3, ' ');
                let id = tokens
                    .next()
                    .ok_or_else(|| Error::ErrSdpInvalidLine(attr.to_owned()))?
                    .to_owned();
                let direction = match tokens.next() {
                    Some("send") => RidDirection::Send,
                    Some("recv") => RidDirection::Recv,
                    _ => return Err(Error::ErrSdpInvalidLine(attr.to_owned())),
                };
                let constraints = tokens.next().unwrap_or("").to_owned();
                self.rids.push(Rid {
                    id,
                    direction,
                    constraints,
                });
            }
            "simulcast" => self.simulcast = Some(value.to_owned()),
            "candidate" => self.candidates.push(value.parse()?),
            "end-of-candidates" => self.end_of_candidates = true,
            _ => self.extra_attributes.push(attr.to_owned()),
        }
        Ok(())
    }

    pub(crate) fn render(&self, out: &mut String, session: &SectionContext<'_>) {
        // the m-line grammar requires at least one format token
        let formats = if self.payload_order.is_empty() {
            "0".to_owned()
        } else {
            self.payload_order
                .iter()
                .map(u8::to_string)
                .collect::<Vec<_>>()
                .join(" ")
        };
        out.push_str(&format!("m={} 9 UDP/TLS/RTP/SAVPF {}\r\n", self.kind, formats));
        out.push_str("c=IN IP4 0.0.0.0\r\n");
        push_attr(out, &format!("mid:{}", self.mid));
        push_attr(out, &self.direction.to_string());
        session.render(out);
        if self.rtcp_mux {
            push_attr(out, "rtcp-mux");
        }
        for pt in &self.payload_order {
            if let Some(payload) = self.payload_types.get(pt) {
                push_attr(out, &format!("rtpmap:{} {}", pt, payload.rtpmap_value()));
                for fb in &payload.rtcp_fbs {
                    push_attr(out, &format!("rtcp-fb:{pt} {fb}"));
                }
                for fmtp in &payload.fmtps {
                    push_attr(out, &format!("fmtp:{pt} {fmtp}"));
                }
            }
        }
        for (id, uri) in &self.extmaps {
            push_attr(out, &format!("extmap:{id} {uri}"));
        }
        for (semantics, ssrcs) in &self.ssrc_groups {
            let list = ssrcs
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(" ");
            push_attr(out, &format!("ssrc-group:{semantics} {list}"));
        }
        for ssrc in &self.ssrcs {
            if let Some(cname) = &ssrc.cname {
                push_attr(out, &format!("ssrc:{} cname:{}", ssrc.ssrc, cname));
            }
            if let Some(msid) = &ssrc.msid {
                push_attr(out, &format!("ssrc:{} msid:{}", ssrc.ssrc, msid));
            }
            if ssrc.cname.is_none() && ssrc.msid.is_none() {
                push_attr(out, &format!("ssrc:{}", ssrc.ssrc));
            }
        }
        for rid in &self.rids {
            if rid.constraints.is_empty() {
                push_attr(out, &format!("rid:{} {}", rid.id, rid.direction));
            } else {
                push_attr(
                    out,
                    &format!("rid:{} {} {}", rid.id, rid.direction, rid.constraints),
                );
            }
        }
        if let Some(simulcast) = &self.simulcast {
            push_attr(out, &format!("simulcast:{simulcast}"));
        }
        for attr in &self.extra_attributes {
            push_attr(out, attr);
        }
        render_candidates(out, &self.candidates, self.end_of_candidates);
    }
}

/// One section of a description: the single application m-line or an
/// audio/video m-line.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Entry {
    Application(Application),
    Media(Media),
}

impl Entry {
    pub fn mid(&self) -> &str {
        match self {
            Entry::Application(app) => &app.mid,
            Entry::Media(media) => &media.mid,
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            Entry::Application(app) => app.direction,
            Entry::Media(media) => media.direction,
        }
    }

    pub fn is_application(&self) -> bool {
        matches!(self, Entry::Application(_))
    }

    pub fn candidates(&self) -> &[Candidate] {
        match self {
            Entry::Application(app) => &app.candidates,
            Entry::Media(media) => &media.candidates,
        }
    }

    pub fn add_candidate(&mut self, candidate: Candidate) {
        match self {
            Entry::Application(app) => app.candidates.push(candidate),
            Entry::Media(media) => media.candidates.push(candidate),
        }
    }

    pub fn set_end_of_candidates(&mut self) {
        match self {
            Entry::Application(app) => app.end_of_candidates = true,
            Entry::Media(media) => media.end_of_candidates = true,
        }
    }

    pub(crate) fn parse_attribute(&mut self, attr: &str) -> Result<()> {
        match self {
            Entry::Application(app) => app.parse_attribute(attr),
            Entry::Media(media) => media.parse_attribute(attr),
        }
    }

    pub(crate) fn render(&self, out: &mut String, session: &SectionContext<'_>) {
        match self {
            Entry::Application(app) => app.render(out, session),
            Entry::Media(media) => media.render(out, session),
        }
    }
}

/// Session-level values repeated inside every rendered m-line block.
pub(crate) struct SectionContext<'a> {
    pub(crate) setup: Option<&'a str>,
    pub(crate) ice_ufrag: Option<&'a str>,
    pub(crate) ice_pwd: Option<&'a str>,
    pub(crate) fingerprint: Option<String>,
}

impl SectionContext<'_> {
    fn render(&self, out: &mut String) {
        if let Some(setup) = self.setup {
            push_attr(out, &format!("setup:{setup}"));
        }
        if let Some(ufrag) = self.ice_ufrag {
            push_attr(out, &format!("ice-ufrag:{ufrag}"));
        }
        if let Some(pwd) = self.ice_pwd {
            push_attr(out, &format!("ice-pwd:{pwd}"));
        }
        if let Some(fingerprint) = &self.fingerprint {
            push_attr(out, &format!("fingerprint:{fingerprint}"));
        }
    }
}

fn push_attr(out: &mut String, attr: &str) {
    out.push_str("a=");
    out.push_str(attr);
    out.push_str("\r\n");
}

fn render_candidates(out: &mut String, candidates: &[Candidate], end: bool) {
    for candidate in candidates {
        push_attr(out, &format!("candidate:{}", candidate.value()));
    }
    if end {
        push_attr(out, "end-of-candidates");
    }
}

fn split_attribute(attr: &str) -> (&str, &str) {
    match attr.split_once(':') {
        Some((key, value)) => (key, value),
        None => (attr, ""),
    }
}
