//! Offer/answer negotiation without any network traffic.

use rtcdc::sdp::{Direction, Entry, MediaKind, PayloadType, SdpType, Setup, Ssrc};
use rtcdc::{Configuration, DataChannelInit, PeerConnection, SignalingState};

fn manual_config() -> Configuration {
    Configuration {
        disable_auto_negotiation: true,
        ..Default::default()
    }
}

fn video_section(mid: &str, direction: Direction) -> rtcdc::sdp::Media {
    let mut media = rtcdc::sdp::Media::new(MediaKind::Video, mid);
    media.direction = direction;
    media.add_payload_type(
        96,
        PayloadType {
            codec: "H264".to_owned(),
            clock_rate: 90_000,
            channels: None,
            fmtps: vec!["packetization-mode=1".to_owned()],
            rtcp_fbs: vec!["nack".to_owned()],
        },
    );
    media.add_ssrc(Ssrc {
        ssrc: 0x0042_4242,
        cname: Some("video-send".to_owned()),
        msid: Some("stream video".to_owned()),
    });
    media
}

#[tokio::test]
async fn test_offer_shape() {
    let pc = PeerConnection::new(manual_config()).await.expect("pc");
    pc.create_data_channel("chat", DataChannelInit::default())
        .await
        .expect("channel");
    pc.add_track(video_section("video0", Direction::SendOnly))
        .await
        .expect("track");

    let offer = pc.set_local_description(None).await.expect("offer");
    assert_eq!(offer.sdp_type, SdpType::Offer);
    assert_eq!(offer.setup, Setup::ActPass);
    assert!(offer.ice_ufrag.is_some());
    assert!(offer.ice_pwd.is_some());
    assert!(offer.fingerprint.is_some());

    let app = offer.application().expect("application m-line");
    assert_eq!(app.sctp_port, Some(5000));
    assert_eq!(app.max_message_size, Some(262_144));

    let rendered = offer.render();
    assert!(rendered.contains("m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n"));
    assert!(rendered.contains("a=setup:actpass\r\n"));
    assert!(rendered.contains("a=sctp-port:5000\r\n"));
    assert!(rendered.contains("a=max-message-size:262144\r\n"));

    assert_eq!(pc.signaling_state(), SignalingState::HaveLocalOffer);
    pc.close().await;
}

#[tokio::test]
async fn test_answer_reciprocates_every_mline_in_order() {
    let offerer = PeerConnection::new(manual_config()).await.expect("offerer");
    offerer
        .create_data_channel("chat", DataChannelInit::default())
        .await
        .expect("channel");
    offerer
        .add_track(video_section("video0", Direction::SendOnly))
        .await
        .expect("track");
    let offer = offerer.set_local_description(None).await.expect("offer");

    let answerer = PeerConnection::new(manual_config()).await.expect("answerer");
    answerer
        .set_remote_description(offer.clone())
        .await
        .expect("set remote");
    assert_eq!(answerer.signaling_state(), SignalingState::HaveRemoteOffer);

    let answer = answerer.set_local_description(None).await.expect("answer");
    assert_eq!(answer.sdp_type, SdpType::Answer);
    // the answerer takes the active role
    assert_eq!(answer.setup, Setup::Active);
    assert_eq!(answerer.signaling_state(), SignalingState::Stable);

    // same m-lines, same order, same mids
    assert_eq!(answer.entries.len(), offer.entries.len());
    for (offered, answered) in offer.entries.iter().zip(answer.entries.iter()) {
        assert_eq!(offered.mid(), answered.mid());
        match (offered, answered) {
            (Entry::Application(_), Entry::Application(_)) => {}
            (Entry::Media(offered), Entry::Media(answered)) => {
                assert_eq!(offered.kind, answered.kind);
                assert_eq!(answered.direction, offered.direction.reciprocal());
            }
            _ => panic!("m-line kinds changed between offer and answer"),
        }
    }

    offerer.close().await;
    answerer.close().await;
}

#[tokio::test]
async fn test_remote_description_validation() {
    let pc = PeerConnection::new(manual_config()).await.expect("pc");

    let offerer = PeerConnection::new(manual_config()).await.expect("offerer");
    offerer
        .create_data_channel("x", DataChannelInit::default())
        .await
        .expect("channel");
    let offer = offerer.set_local_description(None).await.expect("offer");

    // missing ufrag
    let mut broken = offer.clone();
    broken.ice_ufrag = None;
    assert!(pc.set_remote_description(broken).await.is_err());

    // missing fingerprint
    let mut broken = offer.clone();
    broken.fingerprint = None;
    assert!(pc.set_remote_description(broken).await.is_err());

    // only inactive media
    let mut broken = offer.clone();
    for entry in &mut broken.entries {
        if let Entry::Application(app) = entry {
            app.direction = Direction::Inactive;
        }
    }
    assert!(pc.set_remote_description(broken).await.is_err());

    // a peer echoing our own credentials back is a self-loop
    let mut looped = offer.clone();
    let local = offerer.local_description().expect("local description");
    looped.ice_ufrag = local.ice_ufrag.clone();
    looped.ice_pwd = local.ice_pwd.clone();
    assert!(offerer.set_remote_description(looped).await.is_err());

    pc.close().await;
    offerer.close().await;
}

#[tokio::test]
async fn test_data_channel_init_validation() {
    let pc = PeerConnection::new(manual_config()).await.expect("pc");

    // 65535 is reserved
    let result = pc
        .create_data_channel(
            "bad",
            DataChannelInit {
                id: Some(65535),
                ..Default::default()
            },
        )
        .await;
    assert!(result.is_err());

    // exclusive reliability knobs
    let result = pc
        .create_data_channel(
            "bad",
            DataChannelInit {
                max_retransmits: Some(1),
                max_packet_life_time: Some(100),
                ..Default::default()
            },
        )
        .await;
    assert!(result.is_err());

    // negotiated channels need an explicit id
    let result = pc
        .create_data_channel(
            "bad",
            DataChannelInit {
                negotiated: true,
                ..Default::default()
            },
        )
        .await;
    assert!(result.is_err());

    pc.close().await;
}

#[tokio::test]
async fn test_precreated_channels_use_even_ids() {
    let pc = PeerConnection::new(manual_config()).await.expect("pc");
    let mut ids = Vec::new();
    for i in 0..3 {
        let channel = pc
            .create_data_channel(format!("ch{i}"), DataChannelInit::default())
            .await
            .expect("channel");
        ids.push(channel.stream_id());
    }
    // prospective DTLS client: even ids from 0
    assert_eq!(ids, vec![0, 2, 4]);
    pc.close().await;
}
