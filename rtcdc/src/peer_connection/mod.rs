//! The peer connection: converts user intent into ordered actions against
//! the transport stack and transport events into user callbacks.

pub mod state;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};

use log::{debug, warn};
use portable_atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use sctp::stream::Stream;
use shared::error::{Error, Result};
use tokio::sync::mpsc;
use util::Conn;

use crate::certificate::Certificate;
use crate::config::Configuration;
use crate::constants::{
    CANDIDATE_RESOLVE_TIMEOUT, DEFAULT_MTU, DEFAULT_SCTP_PORT, MAX_SCTP_STREAMS,
    RECEIVE_BUFFER_LEN,
};
use crate::data_channel::{DataChannel, DataChannelInit};
use crate::message::Message;
use crate::processor::Processor;
use crate::track::Track;
use crate::transport::dtls_transport::DtlsTransport;
use crate::transport::ice_transport::IceTransport;
use crate::transport::ice_udp_mux;
use crate::transport::mux::{match_dtls, match_srtp, Mux};
use crate::transport::sctp_transport::SctpTransport;
use crate::transport::srtp_transport::{MediaEvent, SrtpTransport};
use crate::transport::TransportState;
use state::{DtlsRole, GatheringState, PeerConnectionState, SignalingState};

use sdp::{Candidate, Description, Entry, Fingerprint, SdpType, Setup};

pub type OnLocalDescriptionHdlrFn = Box<
    dyn (FnMut(Description) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>) + Send + Sync,
>;
pub type OnLocalCandidateHdlrFn = Box<
    dyn (FnMut(Candidate) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>) + Send + Sync,
>;
pub type OnStateChangeHdlrFn = Box<
    dyn (FnMut(PeerConnectionState) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>)
        + Send
        + Sync,
>;
pub type OnGatheringStateChangeHdlrFn = Box<
    dyn (FnMut(GatheringState) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>)
        + Send
        + Sync,
>;
pub type OnSignalingStateChangeHdlrFn = Box<
    dyn (FnMut(SignalingState) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>)
        + Send
        + Sync,
>;
pub type OnDataChannelHdlrFn = Box<
    dyn (FnMut(Arc<DataChannel>) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>)
        + Send
        + Sync,
>;
pub type OnTrackHdlrFn = Box<
    dyn (FnMut(Arc<Track>) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>) + Send + Sync,
>;

type HandlerSlot<T> = Arc<arc_swap::ArcSwapOption<tokio::sync::Mutex<T>>>;

/// Events from the transport stack, drained in order by one task.
enum StackEvent {
    Ice(TransportState),
    Dtls(TransportState),
    Sctp(TransportState),
    LocalCandidate(Option<Candidate>),
}

/// A peer-to-peer session multiplexing ICE, DTLS, SCTP and SRTP over a
/// single UDP flow, negotiated via SDP offer/answer.
pub struct PeerConnection {
    config: Configuration,
    certificate: Arc<Certificate>,
    processor: Arc<Processor>,

    connection_state: AtomicU8,
    signaling_state: AtomicU8,
    gathering_state: AtomicU8,
    is_offerer: AtomicBool,
    dtls_role: AtomicU8,
    transports_started: AtomicBool,
    gathering_started: AtomicBool,

    ice: IceTransport,
    dtls: DtlsTransport,
    sctp: SctpTransport,
    mux: tokio::sync::Mutex<Option<Arc<Mux>>>,
    srtp: tokio::sync::Mutex<Option<Arc<SrtpTransport>>>,

    local_description: std::sync::Mutex<Option<Description>>,
    remote_description: std::sync::Mutex<Option<Description>>,
    remote_sctp_port: AtomicUsize,
    remote_max_message_size: AtomicUsize,

    // lookups take the shared lock, inserts the exclusive one
    data_channels: std::sync::RwLock<HashMap<u16, Arc<DataChannel>>>,
    tracks: std::sync::RwLock<HashMap<String, Arc<Track>>>,
    ssrc_to_mid: std::sync::RwLock<HashMap<u32, String>>,

    on_local_description_handler: HandlerSlot<OnLocalDescriptionHdlrFn>,
    on_local_candidate_handler: HandlerSlot<OnLocalCandidateHdlrFn>,
    on_state_change_handler: HandlerSlot<OnStateChangeHdlrFn>,
    on_gathering_state_change_handler: HandlerSlot<OnGatheringStateChangeHdlrFn>,
    on_signaling_state_change_handler: HandlerSlot<OnSignalingStateChangeHdlrFn>,
    on_data_channel_handler: HandlerSlot<OnDataChannelHdlrFn>,
    on_track_handler: HandlerSlot<OnTrackHdlrFn>,
}

impl PeerConnection {
    /// Builds the connection and its ICE agent. The certificate is
    /// generated here; transports start once both descriptions are set.
    pub async fn new(config: Configuration) -> Result<Arc<PeerConnection>> {
        config.check()?;
        let certificate = Arc::new(Certificate::generate(config.certificate_type)?);
        let processor = Arc::new(Processor::new());
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<StackEvent>();

        let ice_tx = event_tx.clone();
        let ice = IceTransport::new(
            &config,
            Box::new(move |transport_state| {
                let _ = ice_tx.send(StackEvent::Ice(transport_state));
            }),
        )
        .await?;

        let mtu = config.mtu.unwrap_or(DEFAULT_MTU);
        let dtls_tx = event_tx.clone();
        let dtls = DtlsTransport::new(
            Arc::clone(&certificate),
            mtu,
            Box::new(move |transport_state| {
                let _ = dtls_tx.send(StackEvent::Dtls(transport_state));
            }),
        );

        let sctp_tx = event_tx.clone();
        let sctp = SctpTransport::new(Box::new(move |transport_state| {
            let _ = sctp_tx.send(StackEvent::Sctp(transport_state));
        }));

        let pc = Arc::new(PeerConnection {
            config,
            certificate,
            processor,
            connection_state: AtomicU8::new(PeerConnectionState::New as u8),
            signaling_state: AtomicU8::new(SignalingState::Stable as u8),
            gathering_state: AtomicU8::new(GatheringState::New as u8),
            is_offerer: AtomicBool::new(false),
            dtls_role: AtomicU8::new(DtlsRole::Client as u8),
            transports_started: AtomicBool::new(false),
            gathering_started: AtomicBool::new(false),
            ice,
            dtls,
            sctp,
            mux: tokio::sync::Mutex::new(None),
            srtp: tokio::sync::Mutex::new(None),
            local_description: std::sync::Mutex::new(None),
            remote_description: std::sync::Mutex::new(None),
            remote_sctp_port: AtomicUsize::new(usize::from(DEFAULT_SCTP_PORT)),
            remote_max_message_size: AtomicUsize::new(0),
            data_channels: std::sync::RwLock::new(HashMap::new()),
            tracks: std::sync::RwLock::new(HashMap::new()),
            ssrc_to_mid: std::sync::RwLock::new(HashMap::new()),
            on_local_description_handler: Arc::new(arc_swap::ArcSwapOption::empty()),
            on_local_candidate_handler: Arc::new(arc_swap::ArcSwapOption::empty()),
            on_state_change_handler: Arc::new(arc_swap::ArcSwapOption::empty()),
            on_gathering_state_change_handler: Arc::new(arc_swap::ArcSwapOption::empty()),
            on_signaling_state_change_handler: Arc::new(arc_swap::ArcSwapOption::empty()),
            on_data_channel_handler: Arc::new(arc_swap::ArcSwapOption::empty()),
            on_track_handler: Arc::new(arc_swap::ArcSwapOption::empty()),
        });

        let candidate_tx = event_tx.clone();
        pc.ice.on_candidate(
            Box::new(move |candidate| {
                let _ = candidate_tx.send(StackEvent::LocalCandidate(candidate));
            }),
            Box::new(|_| {}),
        );

        if pc.config.ice_udp_mux {
            let (ufrag, _) = pc.ice.local_credentials().await;
            ice_udp_mux::register_local_ufrag(pc.config.port_range_begin, &ufrag).await;
        }

        let weak = Arc::downgrade(&pc);
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                let Some(pc) = weak.upgrade() else { return };
                pc.handle_stack_event(event).await;
            }
        });

        Ok(pc)
    }

    pub fn state(&self) -> PeerConnectionState {
        self.connection_state.load(Ordering::SeqCst).into()
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.signaling_state.load(Ordering::SeqCst).into()
    }

    pub fn gathering_state(&self) -> GatheringState {
        self.gathering_state.load(Ordering::SeqCst).into()
    }

    pub fn local_description(&self) -> Option<Description> {
        self.local_description.lock().ok().and_then(|d| d.clone())
    }

    pub fn remote_description(&self) -> Option<Description> {
        self.remote_description.lock().ok().and_then(|d| d.clone())
    }

    /// The outbound message ceiling: the smaller of what we and the peer
    /// advertise, remote 0 meaning unbounded.
    pub fn remote_max_message_size(&self) -> usize {
        let local = self.config.local_max_message_size();
        match self.remote_max_message_size.load(Ordering::SeqCst) {
            0 => local,
            remote => local.min(remote),
        }
    }

    // callback registration; all of them run on the connection's processor

    pub fn on_local_description(&self, f: OnLocalDescriptionHdlrFn) {
        self.on_local_description_handler
            .store(Some(Arc::new(tokio::sync::Mutex::new(f))));
    }

    pub fn on_local_candidate(&self, f: OnLocalCandidateHdlrFn) {
        self.on_local_candidate_handler
            .store(Some(Arc::new(tokio::sync::Mutex::new(f))));
    }

    pub fn on_state_change(&self, f: OnStateChangeHdlrFn) {
        self.on_state_change_handler
            .store(Some(Arc::new(tokio::sync::Mutex::new(f))));
    }

    pub fn on_gathering_state_change(&self, f: OnGatheringStateChangeHdlrFn) {
        self.on_gathering_state_change_handler
            .store(Some(Arc::new(tokio::sync::Mutex::new(f))));
    }

    pub fn on_signaling_state_change(&self, f: OnSignalingStateChangeHdlrFn) {
        self.on_signaling_state_change_handler
            .store(Some(Arc::new(tokio::sync::Mutex::new(f))));
    }

    pub fn on_data_channel(&self, f: OnDataChannelHdlrFn) {
        self.on_data_channel_handler
            .store(Some(Arc::new(tokio::sync::Mutex::new(f))));
    }

    pub fn on_track(&self, f: OnTrackHdlrFn) {
        self.on_track_handler
            .store(Some(Arc::new(tokio::sync::Mutex::new(f))));
    }

    /// Creates a data channel with a pre-selected SCTP stream id whose
    /// parity matches the prospective DTLS role. If the role flips during
    /// negotiation, ids re-pair before SCTP starts.
    pub async fn create_data_channel(
        self: &Arc<Self>,
        label: impl Into<String>,
        init: DataChannelInit,
    ) -> Result<Arc<DataChannel>> {
        if self.state() == PeerConnectionState::Closed {
            return Err(Error::ErrConnectionClosed);
        }
        let label = label.into();
        if label.len() > usize::from(u16::MAX) {
            return Err(Error::ErrStringSizeLimit);
        }
        if init.protocol.len() > usize::from(u16::MAX) {
            return Err(Error::ErrProtocolTooLarge);
        }
        if init.max_retransmits.is_some() && init.max_packet_life_time.is_some() {
            return Err(Error::ErrRetransmitsAndLifeTime);
        }
        if init.negotiated && init.id.is_none() {
            return Err(Error::ErrNegotiatedWithoutId);
        }

        let channel = {
            let mut channels = self
                .data_channels
                .write()
                .map_err(|_| Error::Other("data channel table poisoned".to_owned()))?;
            if channels.len() >= usize::from(MAX_SCTP_STREAMS) - 1 {
                return Err(Error::ErrTooManyDataChannels);
            }

            let stream_id = match init.id {
                Some(id) if id == u16::MAX => return Err(Error::ErrReservedDataChannelId),
                Some(id) => {
                    if channels.contains_key(&id) {
                        return Err(Error::ErrDataChannelIdInUse);
                    }
                    id
                }
                None => {
                    let parity = DtlsRole::from(self.dtls_role.load(Ordering::SeqCst))
                        .stream_parity();
                    let mut id = parity;
                    while channels.contains_key(&id) {
                        id = id
                            .checked_add(2)
                            .filter(|&id| id < u16::MAX)
                            .ok_or(Error::ErrOutOfSctpStreams)?;
                    }
                    id
                }
            };

            let channel = DataChannel::new(
                label,
                init,
                stream_id,
                self.config.local_max_message_size(),
                Arc::clone(&self.processor),
            );
            channels.insert(stream_id, Arc::clone(&channel));
            channel
        };

        if self.sctp.state() == TransportState::Connected {
            let pc = Arc::clone(self);
            let to_open = Arc::clone(&channel);
            tokio::spawn(async move {
                if let Err(e) = pc.open_channel(&to_open).await {
                    warn!("opening data channel failed: {e}");
                }
            });
        } else if !self.config.disable_auto_negotiation
            && self.local_description().is_none()
            && self.signaling_state() == SignalingState::Stable
        {
            self.set_local_description(Some(SdpType::Offer)).await?;
        }

        Ok(channel)
    }

    /// Registers a media section for the next offer/answer and returns its
    /// track.
    pub async fn add_track(&self, media: sdp::Media) -> Result<Arc<Track>> {
        if self.state() == PeerConnectionState::Closed {
            return Err(Error::ErrConnectionClosed);
        }
        let track = Track::new(media.clone(), Arc::clone(&self.processor));
        {
            let mut tracks = self
                .tracks
                .write()
                .map_err(|_| Error::Other("track table poisoned".to_owned()))?;
            tracks.insert(media.mid.clone(), Arc::clone(&track));
        }
        {
            let mut map = self
                .ssrc_to_mid
                .write()
                .map_err(|_| Error::Other("ssrc map poisoned".to_owned()))?;
            for ssrc in media.ssrc_ids() {
                map.insert(ssrc, media.mid.clone());
            }
        }
        Ok(track)
    }

    /// Builds and publishes the local description. Without an explicit
    /// type, `Offer` when stable and `Answer` after a remote offer.
    pub async fn set_local_description(
        self: &Arc<Self>,
        sdp_type: Option<SdpType>,
    ) -> Result<Description> {
        if self.state() == PeerConnectionState::Closed {
            return Err(Error::ErrConnectionClosed);
        }
        let signaling = self.signaling_state();
        let sdp_type = match sdp_type {
            Some(sdp_type) => sdp_type,
            None => match signaling {
                SignalingState::Stable => SdpType::Offer,
                SignalingState::HaveRemoteOffer | SignalingState::HaveRemotePranswer => {
                    SdpType::Answer
                }
                _ => return Err(Error::ErrIncorrectSignalingState),
            },
        };
        match (sdp_type, signaling) {
            (SdpType::Offer, SignalingState::Stable)
            | (SdpType::Offer, SignalingState::HaveLocalOffer)
            | (SdpType::Answer | SdpType::Pranswer, SignalingState::HaveRemoteOffer)
            | (SdpType::Answer | SdpType::Pranswer, SignalingState::HaveRemotePranswer) => {}
            _ => return Err(Error::ErrIncorrectSignalingState),
        }

        let (ufrag, pwd) = self.ice.local_credentials().await;
        let mut description = Description::new(sdp_type);
        description.ice_ufrag = Some(ufrag);
        description.ice_pwd = Some(pwd);
        description.fingerprint = Some(Fingerprint::new(
            "sha-256",
            self.certificate.fingerprint.clone(),
        ));

        let remote = self.remote_description();
        match sdp_type {
            SdpType::Offer => {
                description.setup = Setup::ActPass;
                self.is_offerer.store(true, Ordering::SeqCst);
            }
            SdpType::Answer | SdpType::Pranswer => {
                let remote = remote.as_ref().ok_or(Error::ErrNoRemoteDescription)?;
                description.setup = match remote.setup {
                    // the answerer takes the active role unless forced
                    Setup::ActPass | Setup::Passive => Setup::Active,
                    Setup::Active => Setup::Passive,
                };
                let role = match description.setup {
                    Setup::Active => DtlsRole::Client,
                    _ => DtlsRole::Server,
                };
                self.settle_dtls_role(role);
            }
            SdpType::Rollback => return Err(Error::ErrIncorrectSignalingState),
        }

        self.build_local_entries(&mut description, remote.as_ref())?;

        {
            let mut slot = self
                .local_description
                .lock()
                .map_err(|_| Error::Other("local description poisoned".to_owned()))?;
            *slot = Some(description.clone());
        }
        let next_signaling = match sdp_type {
            SdpType::Offer => SignalingState::HaveLocalOffer,
            SdpType::Pranswer => SignalingState::HaveLocalPranswer,
            _ => SignalingState::Stable,
        };
        self.set_signaling_state(next_signaling);

        self.dispatch_local_description(description.clone());

        // gather once; further descriptions reuse the same candidates
        if !self.gathering_started.swap(true, Ordering::SeqCst) {
            self.set_gathering_state(GatheringState::InProgress);
            self.ice.gather()?;
        }

        self.maybe_start_transports();
        Ok(description)
    }

    /// Validates and applies a remote description, creating tracks for
    /// unknown media m-lines and planning the SCTP association for the
    /// application m-line.
    pub async fn set_remote_description(self: &Arc<Self>, description: Description) -> Result<()> {
        if self.state() == PeerConnectionState::Closed {
            return Err(Error::ErrConnectionClosed);
        }

        if description.sdp_type == SdpType::Rollback {
            if let Ok(mut slot) = self.remote_description.lock() {
                *slot = None;
            }
            self.set_signaling_state(SignalingState::Stable);
            return Ok(());
        }

        let remote_ufrag = description
            .ice_ufrag
            .clone()
            .ok_or(Error::ErrSdpMissingIceUfrag)?;
        let remote_pwd = description
            .ice_pwd
            .clone()
            .ok_or(Error::ErrSdpMissingIcePwd)?;
        let fingerprint = description
            .fingerprint
            .as_ref()
            .ok_or(Error::ErrSdpMissingFingerprint)?;
        if !fingerprint.is_valid() {
            return Err(Error::ErrSdpInvalidFingerprint);
        }
        if !description.has_active_media() {
            return Err(Error::ErrSdpNoActiveMediaLine);
        }
        let (our_ufrag, our_pwd) = self.ice.local_credentials().await;
        if remote_ufrag == our_ufrag && remote_pwd == our_pwd {
            return Err(Error::ErrSdpLocalCredentials);
        }

        let signaling = self.signaling_state();
        let next_signaling = match (description.sdp_type, signaling) {
            (SdpType::Offer, SignalingState::Stable)
            | (SdpType::Offer, SignalingState::HaveRemoteOffer) => SignalingState::HaveRemoteOffer,
            (SdpType::Answer, SignalingState::HaveLocalOffer)
            | (SdpType::Answer, SignalingState::HaveRemotePranswer) => SignalingState::Stable,
            (SdpType::Pranswer, SignalingState::HaveLocalOffer) => {
                SignalingState::HaveRemotePranswer
            }
            _ => return Err(Error::ErrIncorrectSignalingState),
        };

        if description.sdp_type == SdpType::Offer {
            self.is_offerer.store(false, Ordering::SeqCst);
        }

        // our DTLS role follows the remote a=setup
        match (description.sdp_type, description.setup) {
            // remote takes the client role, so we serve
            (_, Setup::Active) => self.settle_dtls_role(DtlsRole::Server),
            (_, Setup::Passive) => self.settle_dtls_role(DtlsRole::Client),
            // actpass in an offer: settled when our answer picks active
            (_, Setup::ActPass) => {}
        }

        for entry in &description.entries {
            match entry {
                Entry::Application(app) => {
                    self.remote_sctp_port.store(
                        usize::from(app.sctp_port.unwrap_or(DEFAULT_SCTP_PORT)),
                        Ordering::SeqCst,
                    );
                    self.remote_max_message_size
                        .store(app.max_message_size.unwrap_or(65536), Ordering::SeqCst);
                }
                Entry::Media(media) => self.reconcile_remote_media(media).await?,
            }
        }

        {
            let mut slot = self
                .remote_description
                .lock()
                .map_err(|_| Error::Other("remote description poisoned".to_owned()))?;
            *slot = Some(description.clone());
        }
        self.set_signaling_state(next_signaling);

        // candidates carried inside the description
        for entry in &description.entries {
            for candidate in entry.candidates() {
                let mut candidate = candidate.clone();
                candidate.mid = Some(entry.mid().to_owned());
                if let Err(e) = self.add_remote_candidate(candidate).await {
                    warn!("remote candidate rejected: {e}");
                }
            }
        }

        if description.sdp_type == SdpType::Offer && !self.config.disable_auto_negotiation {
            self.set_local_description(Some(SdpType::Answer)).await?;
        } else {
            self.maybe_start_transports();
        }
        Ok(())
    }

    /// The peer's announced `a=sctp-port`.
    pub fn remote_sctp_port(&self) -> u16 {
        self.remote_sctp_port.load(Ordering::SeqCst) as u16
    }

    /// Adds a trickled remote candidate, resolving hostnames asynchronously
    /// with a bounded timeout.
    pub async fn add_remote_candidate(self: &Arc<Self>, mut candidate: Candidate) -> Result<()> {
        if self.state() == PeerConnectionState::Closed {
            return Err(Error::ErrConnectionClosed);
        }
        if candidate.mid.is_none() {
            // bundle: every candidate belongs to the single flow
            candidate.mid = self
                .remote_description()
                .and_then(|remote| remote.entries.first().map(|e| e.mid().to_owned()));
        }

        if candidate.is_resolved() {
            return self.ice.add_remote_candidate(&candidate).await;
        }

        let pc = Arc::downgrade(self);
        tokio::spawn(async move {
            let host = candidate.address.clone();
            let port = candidate.port;
            let resolved = tokio::time::timeout(
                CANDIDATE_RESOLVE_TIMEOUT,
                tokio::net::lookup_host((host.as_str(), port)),
            )
            .await;
            let address = match resolved {
                Ok(Ok(mut addrs)) => addrs.next(),
                _ => None,
            };
            let Some(address) = address else {
                debug!("could not resolve candidate host {host}");
                return;
            };
            candidate.resolve(address.ip());
            if let Some(pc) = pc.upgrade() {
                if let Err(e) = pc.ice.add_remote_candidate(&candidate).await {
                    debug!("resolved candidate rejected: {e}");
                }
            }
        });
        Ok(())
    }

    /// Closes everything. Idempotent; the terminal state is observable via
    /// the state callback.
    pub async fn close(&self) {
        let previous: PeerConnectionState = self
            .connection_state
            .swap(PeerConnectionState::Closed as u8, Ordering::SeqCst)
            .into();
        if previous == PeerConnectionState::Closed {
            return;
        }
        self.dispatch_state(PeerConnectionState::Closed);

        // drain channels first so their closing resets ride the live stack
        let channels: Vec<Arc<DataChannel>> = self
            .data_channels
            .read()
            .map(|channels| channels.values().cloned().collect())
            .unwrap_or_default();
        for channel in channels {
            let _ = channel.close().await;
        }
        let tracks: Vec<Arc<Track>> = self
            .tracks
            .read()
            .map(|tracks| tracks.values().cloned().collect())
            .unwrap_or_default();
        for track in tracks {
            track.finish_close();
        }

        // teardown in reverse build order
        self.sctp.stop().await;
        self.dtls.stop().await;
        {
            let mux = { self.mux.lock().await.take() };
            if let Some(mux) = mux {
                mux.close().await;
            }
        }
        self.ice.stop().await;
    }

    // --- negotiation internals ---

    fn build_local_entries(
        &self,
        description: &mut Description,
        remote: Option<&Description>,
    ) -> Result<()> {
        let tracks = self
            .tracks
            .read()
            .map_err(|_| Error::Other("track table poisoned".to_owned()))?;

        // reciprocate every remote m-line in order
        if let Some(remote) = remote {
            for entry in &remote.entries {
                match entry {
                    Entry::Application(app) => {
                        let mut local = sdp::Application::new(app.mid.clone());
                        local.sctp_port = Some(DEFAULT_SCTP_PORT);
                        local.max_message_size = Some(self.config.local_max_message_size());
                        description.add_application(local);
                    }
                    Entry::Media(media) => {
                        let mut local = match tracks.get(&media.mid) {
                            Some(track) => track.description(),
                            None => sdp::Media::new(media.kind, media.mid.clone()),
                        };
                        local.mid = media.mid.clone();
                        local.direction = media.direction.reciprocal();
                        if local.payload_order.is_empty() {
                            local.payload_order = media.payload_order.clone();
                            local.payload_types = media.payload_types.clone();
                        }
                        description.add_media(local);
                    }
                }
            }
        }

        // then whatever only exists locally
        let has_channels = self
            .data_channels
            .read()
            .map(|channels| !channels.is_empty())
            .unwrap_or(false);
        if has_channels && description.application().is_none() {
            let mid = next_free_mid(description);
            let mut app = sdp::Application::new(mid);
            app.sctp_port = Some(DEFAULT_SCTP_PORT);
            app.max_message_size = Some(self.config.local_max_message_size());
            description.add_application(app);
        }
        for (mid, track) in tracks.iter() {
            if !description.has_mid(mid) {
                description.add_media(track.description());
            }
        }

        if description.entries.is_empty() {
            return Err(Error::ErrSdpNoActiveMediaLine);
        }
        Ok(())
    }

    async fn reconcile_remote_media(self: &Arc<Self>, media: &sdp::Media) -> Result<()> {
        let known = self
            .tracks
            .read()
            .map(|tracks| tracks.contains_key(&media.mid))
            .unwrap_or(false);

        if !known {
            // an m-line we did not offer: receive-only reciprocation
            let mut local_view = media.clone();
            local_view.direction = media.direction.reciprocal();
            let track = Track::new(local_view, Arc::clone(&self.processor));
            if let Ok(mut tracks) = self.tracks.write() {
                tracks.insert(media.mid.clone(), Arc::clone(&track));
            }
            self.dispatch_track(track);
        }

        if let Ok(mut map) = self.ssrc_to_mid.write() {
            for ssrc in media.ssrc_ids() {
                map.insert(ssrc, media.mid.clone());
            }
        }
        Ok(())
    }

    fn settle_dtls_role(&self, role: DtlsRole) {
        let previous: DtlsRole = self
            .dtls_role
            .swap(role as u8, Ordering::SeqCst)
            .into();
        if previous == role {
            return;
        }
        debug!("dtls role settled as {role:?}, re-pairing data channel ids");

        let Ok(mut channels) = self.data_channels.write() else {
            return;
        };
        let shifted: Vec<(u16, Arc<DataChannel>)> = channels
            .drain()
            .map(|(id, channel)| {
                let keep = channel.init().negotiated || channel.init().id.is_some();
                let new_id = if keep {
                    id
                } else {
                    id - (id % 2) + role.stream_parity()
                };
                channel.shift_stream_id(new_id);
                (new_id, channel)
            })
            .collect();
        channels.extend(shifted);
    }

    // --- transport stack orchestration ---

    fn maybe_start_transports(self: &Arc<Self>) {
        let ready = self.local_description().is_some() && self.remote_description().is_some();
        if !ready || self.transports_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let pc = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = pc.connect_stack().await {
                warn!("transport stack failed: {e}");
                pc.set_connection_state(PeerConnectionState::Failed);
            }
        });
    }

    /// Brings the stack up in order: ICE, then DTLS, then SCTP and SRTP.
    async fn connect_stack(self: &Arc<Self>) -> Result<()> {
        self.set_connection_state(PeerConnectionState::Connecting);

        let remote = self
            .remote_description()
            .ok_or(Error::ErrNoRemoteDescription)?;
        let local = self
            .local_description()
            .ok_or(Error::ErrNoRemoteDescription)?;
        let remote_ufrag = remote.ice_ufrag.clone().unwrap_or_default();
        let remote_pwd = remote.ice_pwd.clone().unwrap_or_default();
        let remote_fingerprint = remote
            .fingerprint
            .as_ref()
            .map(|f| f.value.clone())
            .unwrap_or_default();

        let controlling = self.is_offerer.load(Ordering::SeqCst);
        let conn = self.ice.start(controlling, remote_ufrag, remote_pwd).await?;

        let mux = Mux::new(conn, RECEIVE_BUFFER_LEN);
        {
            let mut slot = self.mux.lock().await;
            *slot = Some(Arc::clone(&mux));
        }

        let is_client = DtlsRole::from(self.dtls_role.load(Ordering::SeqCst)) == DtlsRole::Client;
        let wants_media =
            remote.media_sections().next().is_some() || local.media_sections().next().is_some();

        let dtls_endpoint = mux.new_endpoint(match_dtls()).await;
        let dtls_conn = self
            .dtls
            .start(dtls_endpoint, is_client, remote_fingerprint, wants_media)
            .await?;

        if wants_media {
            match self.dtls.extract_srtp_keys(is_client).await {
                Ok(material) => {
                    let srtp_endpoint = mux.new_endpoint(match_srtp()).await;
                    let srtp = Arc::new(SrtpTransport::new(srtp_endpoint, material)?);
                    {
                        let mut slot = self.srtp.lock().await;
                        *slot = Some(Arc::clone(&srtp));
                    }
                    let weak = Arc::downgrade(self);
                    srtp.spawn_receive_loop(Box::new(move |event| {
                        if let Some(pc) = weak.upgrade() {
                            pc.demux_media(event);
                        }
                    }));
                    let tracks: Vec<Arc<Track>> = self
                        .tracks
                        .read()
                        .map(|tracks| tracks.values().cloned().collect())
                        .unwrap_or_default();
                    for track in tracks {
                        track.open(Arc::clone(&srtp)).await;
                    }
                }
                Err(e) => warn!("no SRTP keys negotiated: {e}"),
            }
        }

        let has_application = remote.application().is_some() || local.application().is_some();
        if has_application {
            let net_conn: Arc<dyn Conn + Send + Sync> = dtls_conn;
            self.sctp
                .start(net_conn, self.config.local_max_message_size())
                .await?;

            let weak = Arc::downgrade(self);
            self.sctp
                .spawn_accept_loop(Box::new(move |stream| {
                    let Some(pc) = weak.upgrade() else { return };
                    tokio::spawn(async move {
                        pc.accept_stream(stream).await;
                    });
                }))
                .await?;

            let mut channels: Vec<Arc<DataChannel>> = self
                .data_channels
                .read()
                .map(|channels| channels.values().cloned().collect())
                .unwrap_or_default();
            channels.sort_by_key(|channel| channel.stream_id());
            for channel in channels {
                if let Err(e) = self.open_channel(&channel).await {
                    warn!(
                        "opening data channel {} failed: {e}",
                        channel.stream_id()
                    );
                }
            }
        }

        self.set_connection_state(PeerConnectionState::Connected);
        Ok(())
    }

    async fn open_channel(self: &Arc<Self>, channel: &Arc<DataChannel>) -> Result<()> {
        let stream = self.sctp.open_stream(channel.stream_id()).await?;
        let inner = Arc::new(
            datachannel::DataChannel::dial(stream, channel.channel_config()).await?,
        );
        let already_open = channel.negotiated();
        channel
            .attach(inner, self.remote_max_message_size(), already_open)
            .await;
        Ok(())
    }

    /// An incoming stream: parity-checked, then DCEP-accepted into a new
    /// channel surfaced via `on_data_channel`.
    async fn accept_stream(self: &Arc<Self>, stream: Arc<Stream>) {
        let stream_id = stream.stream_identifier();

        let exists = self
            .data_channels
            .read()
            .map(|channels| channels.contains_key(&stream_id))
            .unwrap_or(false);
        if exists {
            debug!("incoming stream {stream_id} already has a channel, ignoring");
            return;
        }

        // the remote's ids carry the opposite parity of ours
        let our_parity = DtlsRole::from(self.dtls_role.load(Ordering::SeqCst)).stream_parity();
        if stream_id % 2 != 1 - our_parity {
            warn!("incoming stream {stream_id} has wrong parity, dropping");
            let _ = stream.shutdown(std::net::Shutdown::Both).await;
            return;
        }

        let inner = match datachannel::DataChannel::accept(stream, Default::default()).await {
            Ok(inner) => Arc::new(inner),
            Err(e) => {
                warn!("rejecting incoming stream {stream_id}: {e}");
                return;
            }
        };

        let channel_config = inner.config().clone();
        let (max_retransmits, max_packet_life_time) = match channel_config.channel_type {
            datachannel::ChannelType::PartialReliableRexmit
            | datachannel::ChannelType::PartialReliableRexmitUnordered => {
                (Some(channel_config.reliability_parameter as u16), None)
            }
            datachannel::ChannelType::PartialReliableTimed
            | datachannel::ChannelType::PartialReliableTimedUnordered => {
                (None, Some(channel_config.reliability_parameter as u16))
            }
            _ => (None, None),
        };
        let init = DataChannelInit {
            ordered: !channel_config.channel_type.unordered(),
            max_retransmits,
            max_packet_life_time,
            protocol: channel_config.protocol.clone(),
            ..Default::default()
        };
        let channel = DataChannel::new(
            channel_config.label.clone(),
            init,
            stream_id,
            self.config.local_max_message_size(),
            Arc::clone(&self.processor),
        );
        channel
            .attach(inner, self.remote_max_message_size(), true)
            .await;

        if let Ok(mut channels) = self.data_channels.write() {
            channels.insert(stream_id, Arc::clone(&channel));
        }
        self.dispatch_data_channel(channel);
    }

    /// SSRC to mid demultiplexing for unprotected inbound media.
    fn demux_media(self: &Arc<Self>, event: MediaEvent) {
        match event {
            MediaEvent::Rtp { ssrc, data } => {
                let Some(track) = self.track_by_ssrc(ssrc) else {
                    debug!("no track for inbound ssrc {ssrc}");
                    return;
                };
                let mut message = Message::binary(data);
                message.stream = ssrc;
                track.incoming(message);
            }
            MediaEvent::Rtcp { ssrcs, data } => {
                // the whole compound goes to every involved track
                let mut delivered: Vec<String> = Vec::new();
                for ssrc in ssrcs {
                    let Some(track) = self.track_by_ssrc(ssrc) else {
                        continue;
                    };
                    let mid = track.mid();
                    if delivered.contains(&mid) {
                        continue;
                    }
                    delivered.push(mid);
                    let mut message = Message::binary(data.clone());
                    message.stream = ssrc;
                    track.incoming(message);
                }
            }
        }
    }

    fn track_by_ssrc(&self, ssrc: u32) -> Option<Arc<Track>> {
        let mid = self
            .ssrc_to_mid
            .read()
            .ok()
            .and_then(|map| map.get(&ssrc).cloned())?;
        self.tracks
            .read()
            .ok()
            .and_then(|tracks| tracks.get(&mid).cloned())
    }

    // --- state plumbing ---

    async fn handle_stack_event(self: &Arc<Self>, event: StackEvent) {
        match event {
            StackEvent::Ice(transport_state) => match transport_state {
                TransportState::Failed => {
                    self.set_connection_state(PeerConnectionState::Failed)
                }
                TransportState::Disconnected => {
                    if self.state() == PeerConnectionState::Connected {
                        self.set_connection_state(PeerConnectionState::Disconnected);
                    }
                }
                TransportState::Connecting => {
                    if self.state() == PeerConnectionState::New {
                        self.set_connection_state(PeerConnectionState::Connecting);
                    }
                }
                _ => {}
            },
            StackEvent::Dtls(transport_state) | StackEvent::Sctp(transport_state) => {
                if transport_state == TransportState::Failed {
                    self.set_connection_state(PeerConnectionState::Failed);
                }
            }
            StackEvent::LocalCandidate(Some(mut candidate)) => {
                if let Ok(mut slot) = self.local_description.lock() {
                    if let Some(local) = slot.as_mut() {
                        if candidate.mid.is_none() {
                            candidate.mid = local.entries.first().map(|e| e.mid().to_owned());
                        }
                        local.add_candidate(candidate.clone());
                    }
                }
                self.dispatch_local_candidate(candidate);
            }
            StackEvent::LocalCandidate(None) => {
                if let Ok(mut slot) = self.local_description.lock() {
                    if let Some(local) = slot.as_mut() {
                        local.set_end_of_candidates();
                    }
                }
                self.set_gathering_state(GatheringState::Complete);
            }
        }
    }

    fn set_connection_state(&self, next: PeerConnectionState) {
        let current = self.state();
        if current == PeerConnectionState::Closed || current == next {
            return;
        }
        // Failed is only left through close()
        if current == PeerConnectionState::Failed && next != PeerConnectionState::Closed {
            return;
        }
        self.connection_state.store(next as u8, Ordering::SeqCst);
        self.dispatch_state(next);
    }

    fn set_signaling_state(&self, next: SignalingState) {
        let previous: SignalingState = self
            .signaling_state
            .swap(next as u8, Ordering::SeqCst)
            .into();
        if previous == next {
            return;
        }
        let handler = Arc::clone(&self.on_signaling_state_change_handler);
        self.processor.enqueue(async move {
            if let Some(handler) = handler.load_full() {
                let mut f = handler.lock().await;
                f(next).await;
            }
        });
    }

    fn set_gathering_state(&self, next: GatheringState) {
        let previous: GatheringState = self
            .gathering_state
            .swap(next as u8, Ordering::SeqCst)
            .into();
        if previous == next {
            return;
        }
        let handler = Arc::clone(&self.on_gathering_state_change_handler);
        self.processor.enqueue(async move {
            if let Some(handler) = handler.load_full() {
                let mut f = handler.lock().await;
                f(next).await;
            }
        });
    }

    fn dispatch_state(&self, next: PeerConnectionState) {
        let handler = Arc::clone(&self.on_state_change_handler);
        self.processor.enqueue(async move {
            if let Some(handler) = handler.load_full() {
                let mut f = handler.lock().await;
                f(next).await;
            }
        });
    }

    fn dispatch_local_description(&self, description: Description) {
        let handler = Arc::clone(&self.on_local_description_handler);
        self.processor.enqueue(async move {
            if let Some(handler) = handler.load_full() {
                let mut f = handler.lock().await;
                f(description).await;
            }
        });
    }

    fn dispatch_local_candidate(&self, candidate: Candidate) {
        let handler = Arc::clone(&self.on_local_candidate_handler);
        self.processor.enqueue(async move {
            if let Some(handler) = handler.load_full() {
                let mut f = handler.lock().await;
                f(candidate).await;
            }
        });
    }

    fn dispatch_data_channel(&self, channel: Arc<DataChannel>) {
        let handler = Arc::clone(&self.on_data_channel_handler);
        self.processor.enqueue(async move {
            if let Some(handler) = handler.load_full() {
                let mut f = handler.lock().await;
                f(channel).await;
            }
        });
    }

    fn dispatch_track(&self, track: Arc<Track>) {
        let handler = Arc::clone(&self.on_track_handler);
        self.processor.enqueue(async move {
            if let Some(handler) = handler.load_full() {
                let mut f = handler.lock().await;
                f(track).await;
            }
        });
    }
}

/// Smallest decimal mid not yet present in the description.
fn next_free_mid(description: &Description) -> String {
    let mut n = 0usize;
    loop {
        let mid = n.to_string();
        if !description.has_mid(&mid) {
            return mid;
        }
        n += 1;
    }
}
