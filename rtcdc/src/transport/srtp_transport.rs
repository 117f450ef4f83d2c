//! SRTP/SRTCP protection with keys installed from the DTLS exporter, plus
//! RTP/RTCP classification on both paths.

use std::sync::Arc;

use bytes::Bytes;
use log::{debug, Level};
use shared::counter::LogCounter;
use shared::error::{Error, Result};
use srtp::context::Context;
use tokio::sync::Mutex;
use util::Conn;

use crate::message::Message;
use crate::transport::dtls_transport::SrtpKeyMaterial;
use crate::transport::mux::Endpoint;

static COUNTER_UNKNOWN_RTCP_TYPE: LogCounter =
    LogCounter::new(Level::Debug, "unknown RTCP packet types received");

static COUNTER_UNPROTECT_FAILED: LogCounter =
    LogCounter::new(Level::Warn, "SRTP packets failed to unprotect");

/// An unprotected inbound packet handed up for demultiplexing.
pub(crate) enum MediaEvent {
    /// One RTP packet; `ssrc` keys the track lookup.
    Rtp { ssrc: u32, data: Bytes },
    /// A whole RTCP compound packet with every SSRC found while walking it.
    Rtcp { ssrcs: Vec<u32>, data: Bytes },
}

pub(crate) type OnMediaFn = Box<dyn Fn(MediaEvent) + Send + Sync>;

pub(crate) struct SrtpTransport {
    endpoint: Arc<Endpoint>,
    // separate contexts for each direction
    outbound: Mutex<Context>,
    inbound: Mutex<Context>,
}

impl SrtpTransport {
    pub(crate) fn new(endpoint: Arc<Endpoint>, material: SrtpKeyMaterial) -> Result<SrtpTransport> {
        let keys = material.keys;
        let outbound = Context::new(
            &keys.local_master_key,
            &keys.local_master_salt,
            material.profile,
            None,
            None,
        )?;
        let inbound = Context::new(
            &keys.remote_master_key,
            &keys.remote_master_salt,
            material.profile,
            None,
            None,
        )?;
        Ok(SrtpTransport {
            endpoint,
            outbound: Mutex::new(outbound),
            inbound: Mutex::new(inbound),
        })
    }

    /// Protects and sends one RTP or RTCP packet. The second byte decides
    /// which: RTCP packet types live in [200..207].
    pub(crate) async fn send_media(&self, message: Message) -> Result<()> {
        let data = message.data;
        let protected = {
            let mut context = self.outbound.lock().await;
            if is_rtcp(&data) {
                context.encrypt_rtcp(&data)?
            } else {
                context.encrypt_rtp(&data)?
            }
        };
        self.endpoint
            .send(&protected)
            .await
            .map_err(Error::from)?;
        Ok(())
    }

    /// Runs the receive loop until the endpoint closes, handing unprotected
    /// packets to `on_media`.
    pub(crate) fn spawn_receive_loop(self: &Arc<Self>, on_media: OnMediaFn) {
        let transport = Arc::clone(self);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            loop {
                let n = match transport.endpoint.recv(&mut buf).await {
                    Ok(n) => n,
                    Err(e) => {
                        debug!("srtp receive loop ended: {e}");
                        return;
                    }
                };
                let packet = &buf[..n];

                if is_rtcp(packet) {
                    let data = {
                        let mut context = transport.inbound.lock().await;
                        match context.decrypt_rtcp(packet) {
                            Ok(data) => data,
                            Err(_) => {
                                COUNTER_UNPROTECT_FAILED.increment();
                                continue;
                            }
                        }
                    };
                    let ssrcs = walk_rtcp_compound(&data);
                    on_media(MediaEvent::Rtcp { ssrcs, data });
                } else {
                    let data = {
                        let mut context = transport.inbound.lock().await;
                        match context.decrypt_rtp(packet) {
                            Ok(data) => data,
                            Err(_) => {
                                COUNTER_UNPROTECT_FAILED.increment();
                                continue;
                            }
                        }
                    };
                    if data.len() < 12 {
                        continue;
                    }
                    let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
                    on_media(MediaEvent::Rtp { ssrc, data });
                }
            }
        });
    }
}

/// RTCP packet types 200..=207 in the second byte; everything else on this
/// flow is RTP.
fn is_rtcp(packet: &[u8]) -> bool {
    packet.len() >= 2 && (200..=207).contains(&packet[1])
}

/// Walks an RTCP compound packet chunk by chunk, collecting the SSRCs of
/// every chunk. Unknown packet types are counted, not fatal.
fn walk_rtcp_compound(data: &[u8]) -> Vec<u32> {
    let mut ssrcs = Vec::new();
    let mut offset = 0usize;

    while offset + 8 <= data.len() {
        let packet_type = data[offset + 1];
        let length_words = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        let chunk_len = (length_words + 1) * 4;
        if offset + chunk_len > data.len() {
            break;
        }

        let sender_ssrc =
            u32::from_be_bytes([data[offset + 4], data[offset + 5], data[offset + 6], data[offset + 7]]);
        if !ssrcs.contains(&sender_ssrc) {
            ssrcs.push(sender_ssrc);
        }

        match packet_type {
            // SR: report blocks follow the 20-byte sender info
            200 if chunk_len >= 32 => {
                collect_report_blocks(&data[offset + 28..offset + chunk_len], &mut ssrcs);
            }
            // RR: report blocks follow the header ssrc
            201 if chunk_len >= 12 => {
                collect_report_blocks(&data[offset + 8..offset + chunk_len], &mut ssrcs);
            }
            // SDES, BYE, APP, feedback
            202..=207 => {}
            _ => COUNTER_UNKNOWN_RTCP_TYPE.increment(),
        }

        offset += chunk_len;
    }
    ssrcs
}

fn collect_report_blocks(mut blocks: &[u8], ssrcs: &mut Vec<u32>) {
    while blocks.len() >= 24 {
        let ssrc = u32::from_be_bytes([blocks[0], blocks[1], blocks[2], blocks[3]]);
        if !ssrcs.contains(&ssrc) {
            ssrcs.push(ssrc);
        }
        blocks = &blocks[24..];
    }
}

#[cfg(test)]
mod srtp_transport_test {
    use super::*;

    #[test]
    fn test_is_rtcp_by_packet_type() {
        assert!(is_rtcp(&[0x80, 200]));
        assert!(is_rtcp(&[0x81, 207]));
        assert!(!is_rtcp(&[0x80, 96]));
        assert!(!is_rtcp(&[0x80, 208]));
        assert!(!is_rtcp(&[0x80]));
    }

    #[test]
    fn test_walk_compound_collects_each_chunk_ssrc() {
        // receiver report (ssrc 0x11223344, no blocks) followed by a bye
        let mut compound = Vec::new();
        compound.extend_from_slice(&[0x80, 201, 0, 1]);
        compound.extend_from_slice(&0x1122_3344u32.to_be_bytes());
        compound.extend_from_slice(&[0x81, 203, 0, 1]);
        compound.extend_from_slice(&0x5566_7788u32.to_be_bytes());

        let ssrcs = walk_rtcp_compound(&compound);
        assert_eq!(ssrcs, vec![0x1122_3344, 0x5566_7788]);
    }

    #[test]
    fn test_walk_compound_with_report_block() {
        let mut compound = Vec::new();
        // RR with one report block: length = 7 words (2 + 1 + 6 - 1)
        compound.extend_from_slice(&[0x81, 201, 0, 7]);
        compound.extend_from_slice(&0xAAAA_AAAAu32.to_be_bytes());
        compound.extend_from_slice(&0xBBBB_BBBBu32.to_be_bytes());
        compound.extend_from_slice(&[0u8; 20]);

        let ssrcs = walk_rtcp_compound(&compound);
        assert!(ssrcs.contains(&0xAAAA_AAAA));
        assert!(ssrcs.contains(&0xBBBB_BBBB));
    }

    #[test]
    fn test_walk_truncated_compound_stops_cleanly() {
        let compound = [0x80, 200, 0, 20, 1, 2, 3];
        assert!(walk_rtcp_compound(&compound).is_empty());
    }
}
