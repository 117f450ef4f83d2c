use crate::candidate::Candidate;
use crate::description::{Description, Fingerprint, Setup, SignalingDescription};
use crate::direction::Direction;
use crate::media::{Application, Entry, Media, MediaKind, PayloadType, Ssrc};
use crate::sdp_type::SdpType;

const BROWSER_OFFER: &str = "v=0\r\n\
o=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
a=group:BUNDLE 0 1\r\n\
a=ice-options:trickle\r\n\
m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n\
c=IN IP4 0.0.0.0\r\n\
a=mid:0\r\n\
a=sendrecv\r\n\
a=setup:actpass\r\n\
a=ice-ufrag:9XVK\r\n\
a=ice-pwd:s3H0123456789abcdefghijk\r\n\
a=fingerprint:sha-256 2A:7F:11:22:33:44:55:66:77:88:99:AA:BB:CC:DD:EE:FF:00:11:22:33:44:55:66:77:88:99:AA:BB:CC:DD:EE\r\n\
a=sctp-port:5000\r\n\
a=max-message-size:262144\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96 97\r\n\
c=IN IP4 0.0.0.0\r\n\
a=mid:1\r\n\
a=sendonly\r\n\
a=rtcp-mux\r\n\
a=rtpmap:96 H264/90000\r\n\
a=rtcp-fb:96 nack\r\n\
a=rtcp-fb:96 nack pli\r\n\
a=fmtp:96 level-asymmetry-allowed=1;packetization-mode=1\r\n\
a=rtpmap:97 rtx/90000\r\n\
a=fmtp:97 apt=96\r\n\
a=extmap:1 urn:ietf:params:rtp-hdrext:sdes:mid\r\n\
a=ssrc-group:FID 1234 5678\r\n\
a=ssrc:1234 cname:stream\r\n\
a=ssrc:1234 msid:stream video\r\n\
a=ssrc:5678 cname:stream\r\n\
a=candidate:1 1 UDP 2122260223 192.168.1.5 56143 typ host\r\n\
a=end-of-candidates\r\n";

#[test]
fn test_parse_browser_offer() {
    let desc = Description::parse(BROWSER_OFFER, SdpType::Offer).unwrap();

    assert_eq!(desc.session_id, "4611731400430051336");
    assert_eq!(desc.ice_ufrag.as_deref(), Some("9XVK"));
    assert_eq!(desc.ice_pwd.as_deref(), Some("s3H0123456789abcdefghijk"));
    assert_eq!(desc.setup, Setup::ActPass);
    let fingerprint = desc.fingerprint.as_ref().unwrap();
    assert_eq!(fingerprint.algorithm, "sha-256");
    assert!(fingerprint.is_valid());

    assert_eq!(desc.entries.len(), 2);
    let app = desc.application().unwrap();
    assert_eq!(app.mid, "0");
    assert_eq!(app.sctp_port, Some(5000));
    assert_eq!(app.max_message_size, Some(262_144));

    let video = desc.media_sections().next().unwrap();
    assert_eq!(video.kind, MediaKind::Video);
    assert_eq!(video.mid, "1");
    assert_eq!(video.direction, Direction::SendOnly);
    assert!(video.rtcp_mux);
    assert_eq!(video.payload_order, vec![96, 97]);
    let h264 = &video.payload_types[&96];
    assert_eq!(h264.codec, "H264");
    assert_eq!(h264.clock_rate, 90_000);
    assert_eq!(h264.rtcp_fbs, vec!["nack".to_owned(), "nack pli".to_owned()]);
    assert_eq!(video.ssrcs.len(), 2);
    assert!(video.has_ssrc(1234));
    assert_eq!(video.ssrcs[0].msid.as_deref(), Some("stream video"));
    assert_eq!(video.ssrc_groups, vec![("FID".to_owned(), vec![1234, 5678])]);
    assert_eq!(video.candidates.len(), 1);
    assert!(video.end_of_candidates);
}

#[test]
fn test_parse_accepts_bare_newlines() {
    let lf = BROWSER_OFFER.replace("\r\n", "\n");
    let desc = Description::parse(&lf, SdpType::Offer).unwrap();
    assert_eq!(desc.entries.len(), 2);
}

#[test]
fn test_render_parse_round_trip() {
    let mut desc = Description::new(SdpType::Offer);
    desc.ice_ufrag = Some("frag".to_owned());
    desc.ice_pwd = Some("password".to_owned());
    desc.fingerprint = Some(Fingerprint::new("sha-256", "AA:BB:CC:DD"));

    let mut app = Application::new("0");
    app.sctp_port = Some(5000);
    app.max_message_size = Some(262_144);
    desc.add_application(app);

    let mut video = Media::new(MediaKind::Video, "1");
    video.direction = Direction::SendOnly;
    video.add_payload_type(
        96,
        PayloadType {
            codec: "H264".to_owned(),
            clock_rate: 90_000,
            channels: None,
            fmtps: vec!["packetization-mode=1".to_owned()],
            rtcp_fbs: vec!["nack".to_owned()],
        },
    );
    video.add_ssrc(Ssrc {
        ssrc: 42,
        cname: Some("video-send".to_owned()),
        msid: Some("stream track".to_owned()),
    });
    desc.add_media(video);

    let mut audio = Media::new(MediaKind::Audio, "2");
    audio.add_payload_type(
        111,
        PayloadType {
            codec: "opus".to_owned(),
            clock_rate: 48_000,
            channels: Some(2),
            fmtps: vec![],
            rtcp_fbs: vec![],
        },
    );
    desc.add_media(audio);

    desc.add_candidate(
        "candidate:1 1 UDP 2122260223 192.168.1.5 56143 typ host"
            .parse::<Candidate>()
            .unwrap(),
    );
    desc.set_end_of_candidates();

    let rendered = desc.render();
    assert!(rendered.contains("m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n"));
    assert!(rendered.contains("a=group:BUNDLE 0 1 2\r\n"));
    assert!(rendered.contains("a=rtpmap:111 opus/48000/2\r\n"));

    let reparsed = Description::parse(&rendered, SdpType::Offer).unwrap();
    assert_eq!(reparsed, desc);
}

#[test]
fn test_payload_less_media_round_trip() {
    let mut desc = Description::new(SdpType::Offer);
    desc.add_media(Media::new(MediaKind::Video, "0"));

    let rendered = desc.render();
    // the m-line grammar still needs a format token
    assert!(rendered.contains("m=video 9 UDP/TLS/RTP/SAVPF 0\r\n"));
    assert!(!rendered.contains("a=rtpmap"));

    let reparsed = Description::parse(&rendered, SdpType::Offer).unwrap();
    assert_eq!(reparsed, desc);
    let media = reparsed.media_sections().next().unwrap();
    assert!(media.payload_order.is_empty());
    assert!(media.payload_types.is_empty());
}

#[test]
fn test_static_payload_type_zero_survives_with_rtpmap() {
    let sdp = "v=0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 0\r\n\
a=mid:0\r\n\
a=rtpmap:0 PCMU/8000\r\n";
    let desc = Description::parse(sdp, SdpType::Offer).unwrap();
    let audio = desc.media_sections().next().unwrap();
    assert_eq!(audio.payload_order, vec![0]);
    assert_eq!(audio.payload_types[&0].codec, "PCMU");
}

#[test]
fn test_duplicate_mid_rejected() {
    let sdp = "v=0\r\n\
m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n\
a=mid:0\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
a=mid:0\r\n";
    assert!(Description::parse(sdp, SdpType::Offer).is_err());
}

#[test]
fn test_bundle_unknown_mid_rejected() {
    let sdp = "v=0\r\n\
a=group:BUNDLE 0 7\r\n\
m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n\
a=mid:0\r\n";
    assert!(Description::parse(sdp, SdpType::Offer).is_err());
}

#[test]
fn test_ssrc_in_two_sections_rejected() {
    let sdp = "v=0\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
a=mid:0\r\n\
a=ssrc:99 cname:a\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
a=mid:1\r\n\
a=ssrc:99 cname:b\r\n";
    assert!(Description::parse(sdp, SdpType::Offer).is_err());
}

#[test]
fn test_inactive_only_description_has_no_active_media() {
    let sdp = "v=0\r\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
a=mid:0\r\n\
a=inactive\r\n";
    let desc = Description::parse(sdp, SdpType::Offer).unwrap();
    assert!(!desc.has_active_media());
}

#[test]
fn test_signaling_json_shape() {
    let mut desc = Description::new(SdpType::Answer);
    desc.add_application(Application::new("0"));
    let json = serde_json::to_string(&SignalingDescription::from(&desc)).unwrap();
    assert!(json.contains("\"type\":\"answer\""));

    let init: SignalingDescription = serde_json::from_str(&json).unwrap();
    let reparsed: Description = init.try_into().unwrap();
    assert_eq!(reparsed.sdp_type, SdpType::Answer);
    assert!(reparsed.application().is_some());
}

#[test]
fn test_entry_accessors() {
    let desc = Description::parse(BROWSER_OFFER, SdpType::Offer).unwrap();
    assert!(desc.has_mid("0"));
    assert!(desc.has_mid("1"));
    assert!(!desc.has_mid("2"));
    assert!(matches!(desc.entry("1"), Some(Entry::Media(_))));
    assert!(desc.has_active_media());
}
