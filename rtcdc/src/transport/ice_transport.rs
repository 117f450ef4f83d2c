//! Thin client of the external ICE agent: configuration, candidates, role,
//! and the connected UDP flow the rest of the stack runs over.

use std::sync::Arc;

use ice::agent::agent_config::AgentConfig;
use ice::agent::Agent;
use ice::candidate::candidate_base::unmarshal_candidate;
use ice::candidate::Candidate;
use ice::network_type::NetworkType;
use ice::state::ConnectionState;
use ice::udp_network::{EphemeralUDP, UDPNetwork};
use log::{debug, warn};
use shared::error::{Error, Result};
use tokio::sync::{mpsc, Mutex};
use util::Conn;

use crate::config::Configuration;
use crate::peer_connection::state::GatheringState;
use crate::transport::ice_udp_mux;
use crate::transport::{OnTransportStateFn, StateCell, TransportState};

pub(crate) type OnCandidateFn = Box<dyn Fn(Option<sdp::Candidate>) + Send + Sync>;
pub(crate) type OnGatheringStateFn = Box<dyn Fn(GatheringState) + Send + Sync>;

pub(crate) struct IceTransport {
    agent: Arc<Agent>,
    state: Arc<StateCell>,
    cancel_tx: Mutex<Option<mpsc::Sender<()>>>,
}

impl IceTransport {
    pub(crate) async fn new(
        config: &Configuration,
        on_state: OnTransportStateFn,
    ) -> Result<IceTransport> {
        let mut urls = Vec::new();
        for server in &config.ice_servers {
            match parse_ice_url(server) {
                Ok(url) => urls.push(url),
                Err(e) => warn!("ignoring invalid ice server {server}: {e}"),
            }
        }

        let udp_network = if config.ice_udp_mux {
            let port = config.port_range_begin;
            UDPNetwork::Muxed(ice_udp_mux::shared_udp_mux(port).await?)
        } else if config.port_range_begin != 0 || config.port_range_end != 0 {
            UDPNetwork::Ephemeral(
                EphemeralUDP::new(config.port_range_begin, config.port_range_end)
                    .map_err(|_| Error::ErrInvalidPortRange)?,
            )
        } else {
            UDPNetwork::default()
        };

        let agent = Agent::new(AgentConfig {
            urls,
            network_types: vec![NetworkType::Udp4, NetworkType::Udp6],
            udp_network,
            ..Default::default()
        })
        .await?;

        let state = Arc::new(StateCell::new(on_state));
        let agent_state = Arc::clone(&state);
        agent.on_connection_state_change(Box::new(move |connection_state: ConnectionState| {
            let next = match connection_state {
                ConnectionState::Checking => TransportState::Connecting,
                ConnectionState::Connected => TransportState::Connected,
                ConnectionState::Completed => TransportState::Completed,
                ConnectionState::Failed => TransportState::Failed,
                _ => TransportState::Disconnected,
            };
            agent_state.set(next);
            Box::pin(async {})
        }));

        Ok(IceTransport {
            agent: Arc::new(agent),
            state,
            cancel_tx: Mutex::new(None),
        })
    }

    /// Local ufrag and pwd for the session description.
    pub(crate) async fn local_credentials(&self) -> (String, String) {
        self.agent.get_local_user_credentials().await
    }

    /// Registers the candidate callback; `None` signals end of gathering.
    pub(crate) fn on_candidate(
        &self,
        on_candidate: OnCandidateFn,
        on_gathering_state: OnGatheringStateFn,
    ) {
        self.agent.on_candidate(Box::new(
            move |candidate: Option<Arc<dyn Candidate + Send + Sync>>| {
                match candidate {
                    Some(candidate) => {
                        match candidate.marshal().parse::<sdp::Candidate>() {
                            Ok(parsed) => on_candidate(Some(parsed)),
                            Err(e) => warn!("dropping unparsable local candidate: {e}"),
                        }
                    }
                    None => {
                        on_gathering_state(GatheringState::Complete);
                        on_candidate(None);
                    }
                }
                Box::pin(async {})
            },
        ));
    }

    pub(crate) fn gather(&self) -> Result<()> {
        Ok(self.agent.gather_candidates()?)
    }

    /// Runs the connectivity checks and resolves with the nominated flow.
    /// The offerer is the controlling agent.
    pub(crate) async fn start(
        &self,
        controlling: bool,
        remote_ufrag: String,
        remote_pwd: String,
    ) -> Result<Arc<dyn Conn + Send + Sync>> {
        self.state.set(TransportState::Connecting);

        let (cancel_tx, cancel_rx) = mpsc::channel(1);
        {
            let mut slot = self.cancel_tx.lock().await;
            *slot = Some(cancel_tx);
        }

        let result: std::result::Result<Arc<dyn Conn + Send + Sync>, ice::Error> = if controlling {
            self.agent
                .dial(cancel_rx, remote_ufrag, remote_pwd)
                .await
                .map(|conn| conn as Arc<dyn Conn + Send + Sync>)
        } else {
            self.agent
                .accept(cancel_rx, remote_ufrag, remote_pwd)
                .await
                .map(|conn| conn as Arc<dyn Conn + Send + Sync>)
        };

        match result {
            Ok(conn) => Ok(conn),
            Err(e) => {
                self.state.set(TransportState::Failed);
                Err(e.into())
            }
        }
    }

    pub(crate) async fn add_remote_candidate(&self, candidate: &sdp::Candidate) -> Result<()> {
        debug!("adding remote candidate {candidate}");
        let parsed = unmarshal_candidate(&candidate.value())
            .map_err(|e| Error::ErrSdpInvalidCandidate(e.to_string()))?;
        let candidate: Arc<dyn Candidate + Send + Sync> = Arc::new(parsed);
        self.agent.add_remote_candidate(&candidate)?;
        Ok(())
    }

    pub(crate) async fn stop(&self) {
        {
            let mut cancel = self.cancel_tx.lock().await;
            if let Some(cancel_tx) = cancel.take() {
                let _ = cancel_tx.send(()).await;
            }
        }
        if let Err(e) = self.agent.close().await {
            debug!("ice agent close: {e}");
        }
    }
}

/// Parses a STUN/TURN url, peeling optional `user:pass@` credentials the way
/// signaling urls carry them.
fn parse_ice_url(raw: &str) -> Result<ice::url::Url> {
    let (scheme, rest) = raw
        .split_once(':')
        .ok_or_else(|| Error::Other(format!("invalid ice url: {raw}")))?;

    let (credentials, host_part) = match rest.rsplit_once('@') {
        Some((credentials, host_part)) => (Some(credentials), host_part),
        None => (None, rest),
    };

    let mut url = ice::url::Url::parse_url(&format!("{scheme}:{host_part}"))?;
    if let Some(credentials) = credentials {
        match credentials.split_once(':') {
            Some((username, password)) => {
                url.username = username.to_owned();
                url.password = password.to_owned();
            }
            None => url.username = credentials.to_owned(),
        }
    }
    Ok(url)
}
