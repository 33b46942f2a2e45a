//! Connection tasks
//!
//! `run_outbound` owns a peer we connect to (with reconnect for persistent
//! peers), `run_inbound` handles one accepted connection. Both hand an
//! established connection to `run_open`, which drives the Open state:
//! watchdog, base protocol answers, routing of application traffic, and
//! the disconnect exchange on the way out.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::time::Instant;

use super::base::{self, common_applications};
use super::retry::Backoff;
use super::watchdog::{Watchdog, WatchdogAction};
use super::{Peer, PeerInput, PeerState};
use crate::common::DisconnectCause;
use crate::error::{DiameterError, DiameterResult, ResultCode};
use crate::message::{base_cmd, DiameterMessage};
use crate::node::NodeContext;
use crate::transport::DiameterTransport;

/// Depth of each connection's outgoing queue
const WRITE_QUEUE_DEPTH: usize = 1024;

/// Why an Open connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseReason {
    /// Local node is stopping
    Stopped,
    /// Remote sent DPR
    Disconnected,
    TransportError,
    /// Remote sent a malformed message; not retried
    ProtocolError,
    WatchdogExpired,
}

/// Transport failure before Open: WaitCE -> Closing -> Closed
fn fail_transport(peer: &Peer) {
    peer.apply(PeerInput::TransportError);
    peer.apply(PeerInput::Drained);
}

/// Resolves once the shutdown flag is raised or its sender is gone
pub(crate) async fn wait_shutdown(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stopping| *stopping).await;
}

/// Drive outbound connections to `peer` until the node stops, or until the
/// first failure for a non-persistent peer
pub(crate) async fn run_outbound(ctx: Arc<NodeContext>, peer: Arc<Peer>) {
    let timers = &ctx.config.timers;
    let mut backoff = Backoff::new(timers.reconnect_base(), timers.reconnect_max());
    let mut shutdown = ctx.shutdown_rx();

    loop {
        if *shutdown.borrow() {
            break;
        }

        // An accepted connection owns the peer; wait for it to go away
        if peer.state() != PeerState::Closed {
            tokio::select! {
                _ = peer.closed() => continue,
                _ = wait_shutdown(&mut shutdown) => break,
            }
        }

        if peer.apply(PeerInput::Connect).is_none() {
            continue;
        }
        peer.counters().inc_connect_attempts();

        let exchanged = tokio::select! {
            result = connect_and_exchange(&ctx, &peer) => result,
            _ = wait_shutdown(&mut shutdown) => {
                peer.force_closed();
                break;
            }
        };

        match exchanged {
            Ok((transport, common)) => {
                backoff.reset();
                match run_open(&ctx, &peer, transport, common).await {
                    CloseReason::Stopped => break,
                    CloseReason::ProtocolError => {
                        log::warn!("[{}] not reconnecting after protocol error", peer.identity());
                        break;
                    }
                    _ => {}
                }
            }
            Err(e) if e.is_protocol() => {
                log::warn!("[{}] capabilities exchange rejected: {e}", peer.identity());
                break;
            }
            Err(e) => {
                log::warn!("[{}] connection failed: {e}", peer.identity());
            }
        }

        if !peer.is_persistent() {
            break;
        }
        let delay = backoff.next_delay();
        log::debug!(
            "[{}] reconnecting in {:?} (attempt {})",
            peer.identity(),
            delay,
            backoff.attempts()
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = wait_shutdown(&mut shutdown) => break,
        }
    }

    peer.release_driver();
    log::debug!("[{}] outbound task finished", peer.identity());
}

async fn candidate_addresses(peer: &Peer) -> DiameterResult<Vec<SocketAddr>> {
    let port = peer.uri().port;
    if !peer.addresses().is_empty() {
        return Ok(peer
            .addresses()
            .iter()
            .map(|ip| SocketAddr::new(*ip, port))
            .collect());
    }
    let resolved: Vec<SocketAddr> = tokio::net::lookup_host((peer.uri().fqdn.as_str(), port))
        .await?
        .collect();
    Ok(resolved)
}

/// Connecting -> WaitCE -> (caller moves to Open)
async fn connect_and_exchange(
    ctx: &NodeContext,
    peer: &Peer,
) -> DiameterResult<(DiameterTransport, Vec<u32>)> {
    let timers = &ctx.config.timers;

    let addresses = match candidate_addresses(peer).await {
        Ok(addresses) => addresses,
        Err(e) => {
            peer.apply(PeerInput::TransportFailed);
            return Err(e);
        }
    };

    let mut last_error = DiameterError::PeerUnavailable(format!(
        "no address for {}",
        peer.identity()
    ));
    let mut connected = None;
    for addr in addresses {
        log::debug!("[{}] connecting to {}", peer.identity(), addr);
        match DiameterTransport::connect_timeout(addr, timers.connect_timeout()).await {
            Ok(transport) => {
                connected = Some(transport);
                break;
            }
            Err(e) => {
                log::debug!("[{}] connect to {} failed: {e}", peer.identity(), addr);
                last_error = e;
            }
        }
    }
    let Some(mut transport) = connected else {
        peer.apply(PeerInput::TransportFailed);
        return Err(last_error);
    };
    peer.apply(PeerInput::TransportUp);

    let local_apps = ctx.local_applications(peer);
    let cer = ctx.local.capabilities_exchange_request(
        &ctx.ids,
        transport.local_addr().ip(),
        &local_apps,
    );
    if let Err(e) = transport.send(&cer).await {
        fail_transport(peer);
        return Err(e);
    }

    let cea = match tokio::time::timeout(timers.capabilities_timeout(), transport.recv()).await {
        Ok(Ok(cea)) => cea,
        Ok(Err(e)) => {
            fail_transport(peer);
            return Err(e);
        }
        Err(_) => {
            peer.apply(PeerInput::CapabilitiesTimeout);
            return Err(DiameterError::Transport(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("no CEA from {} within {:?}", peer.identity(), timers.capabilities_timeout()),
            )));
        }
    };

    let reject = |reason: String| {
        peer.apply(PeerInput::CapabilitiesRejected);
        Err(DiameterError::Protocol(reason))
    };

    if cea.is_request() || cea.command_code() != base_cmd::CAPABILITIES_EXCHANGE {
        return reject(format!("expected CEA, got {cea}"));
    }
    match cea.result_code() {
        Some(code) if ResultCode::from_code(code).is_some_and(ResultCode::is_success) => {}
        code => {
            return reject(format!(
                "CEA result {}{}",
                code.map(|c| c.to_string()).unwrap_or_else(|| "missing".into()),
                cea.error_message()
                    .map(|m| format!(" ({m})"))
                    .unwrap_or_default()
            ))
        }
    }
    if let Some(host) = cea.origin_host() {
        if !host.eq_ignore_ascii_case(peer.identity()) {
            log::warn!(
                "[{}] CEA Origin-Host is {host}, keeping the configured identity",
                peer.identity()
            );
        }
    }

    let common = common_applications(
        &local_apps,
        &cea.auth_application_ids(),
        &cea.acct_application_ids(),
    );
    if !local_apps.is_empty() && common.is_empty() {
        return reject("no common application".into());
    }

    Ok((transport, common))
}

/// Handle one accepted connection: wait for CER, validate it, answer CEA
pub(crate) async fn run_inbound(ctx: Arc<NodeContext>, mut transport: DiameterTransport) {
    let remote = transport.peer_addr();
    let mut shutdown = ctx.shutdown_rx();
    let timeout = ctx.config.timers.capabilities_timeout();

    let cer = tokio::select! {
        received = tokio::time::timeout(timeout, transport.recv()) => match received {
            Ok(Ok(msg)) => msg,
            Ok(Err(e)) => {
                log::debug!("connection from {remote} failed before CER: {e}");
                return;
            }
            Err(_) => {
                log::debug!("no CER from {remote} within {timeout:?}");
                return;
            }
        },
        _ = wait_shutdown(&mut shutdown) => return,
    };

    if !cer.is_request() || cer.command_code() != base_cmd::CAPABILITIES_EXCHANGE {
        log::warn!("closing connection from {remote}: expected CER, got {cer}");
        let _ = transport.shutdown().await;
        return;
    }

    let host_ip = transport.local_addr().ip();
    let refuse = |result_code: ResultCode, apps: &[(u32, crate::application::ApplicationRole)]| {
        ctx.local
            .capabilities_exchange_answer(&cer, result_code, host_ip, apps)
    };

    let Some(origin_host) = cer.origin_host().map(str::to_string) else {
        log::warn!("CER from {remote} without Origin-Host");
        let cea = refuse(ResultCode::MissingAvp, &[]);
        let _ = transport.send(&cea).await;
        let _ = transport.shutdown().await;
        return;
    };

    let Some(peer) = ctx.peers.get(&origin_host).await else {
        log::warn!("rejecting CER from unknown peer {origin_host} ({remote})");
        let cea = refuse(ResultCode::UnknownPeer, &[]);
        let _ = transport.send(&cea).await;
        let _ = transport.shutdown().await;
        return;
    };

    if peer.apply(PeerInput::Accepted).is_none() {
        log::warn!(
            "[{}] rejecting CER from {remote}: peer is {}",
            peer.identity(),
            peer.state()
        );
        let cea = refuse(ResultCode::UnableToComply, &[]);
        let _ = transport.send(&cea).await;
        let _ = transport.shutdown().await;
        return;
    }

    let local_apps = ctx.local_applications(&peer);
    let common = common_applications(
        &local_apps,
        &cer.auth_application_ids(),
        &cer.acct_application_ids(),
    );
    if !local_apps.is_empty() && common.is_empty() {
        log::warn!("[{}] no common application, rejecting CER", peer.identity());
        let cea = refuse(ResultCode::NoCommonApplication, &local_apps);
        peer.apply(PeerInput::CapabilitiesRejected);
        let _ = transport.send(&cea).await;
        let _ = transport.shutdown().await;
        return;
    }

    let cea = refuse(ResultCode::Success, &local_apps);
    if let Err(e) = transport.send(&cea).await {
        log::warn!("[{}] sending CEA failed: {e}", peer.identity());
        fail_transport(&peer);
        return;
    }

    run_open(&ctx, &peer, transport, common).await;
}

/// Drive an Open connection until it closes; leaves the peer Closed
pub(crate) async fn run_open(
    ctx: &NodeContext,
    peer: &Arc<Peer>,
    transport: DiameterTransport,
    common: Vec<u32>,
) -> CloseReason {
    let remote = transport.peer_addr();
    let timers = &ctx.config.timers;
    let (mut reader, mut writer) = transport.into_split();
    let (tx, mut rx) = mpsc::channel::<DiameterMessage>(WRITE_QUEUE_DEPTH);

    let writer_peer = peer.clone();
    let mut writer_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = writer.send(&msg).await {
                log::warn!("[{}] write failed: {e}", writer_peer.identity());
                return;
            }
            writer_peer.counters().inc_messages_sent();
        }
        let _ = writer.shutdown().await;
    });
    let mut writer_finished = false;

    peer.attach(tx.clone(), remote, common.clone());
    peer.apply(PeerInput::CapabilitiesAccepted);
    log::info!(
        "[{}] peer open ({}, applications {:?})",
        peer.identity(),
        remote,
        common
    );
    ctx.peer_opened(peer);

    let mut shutdown = ctx.shutdown_rx();
    let mut watchdog = Watchdog::new(
        timers.watchdog_interval(),
        timers.watchdog_answer_timeout(),
        Instant::now(),
    );

    let reason = loop {
        tokio::select! {
            _ = wait_shutdown(&mut shutdown) => break CloseReason::Stopped,

            _ = tokio::time::sleep_until(watchdog.deadline()) => {
                match watchdog.poll(Instant::now()) {
                    WatchdogAction::Idle => {}
                    WatchdogAction::SendRequest => {
                        let dwr = ctx.local.device_watchdog_request(&ctx.ids);
                        log::debug!("[{}] idle, sending {}", peer.identity(), dwr);
                        if tx.send(dwr).await.is_err() {
                            break CloseReason::TransportError;
                        }
                        peer.counters().inc_watchdogs_sent();
                    }
                    WatchdogAction::Expired => break CloseReason::WatchdogExpired,
                }
            }

            received = reader.recv() => {
                let msg = match received {
                    Ok(msg) => msg,
                    Err(e) if e.is_protocol() => {
                        log::warn!("[{}] malformed message, closing connection: {e}", peer.identity());
                        break CloseReason::ProtocolError;
                    }
                    Err(e) => {
                        log::info!("[{}] connection lost: {e}", peer.identity());
                        break CloseReason::TransportError;
                    }
                };
                watchdog.on_traffic(Instant::now());
                peer.touch();
                peer.counters().inc_messages_received();

                if !base::is_base_message(&msg) {
                    ctx.route(peer, msg).await;
                    continue;
                }
                match (msg.command_code(), msg.is_request()) {
                    (base_cmd::DEVICE_WATCHDOG, true) => {
                        let dwa = ctx.local.device_watchdog_answer(&msg);
                        match tx.try_send(dwa) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) => {
                                log::warn!("[{}] write queue full, DWA dropped", peer.identity());
                            }
                            Err(TrySendError::Closed(_)) => break CloseReason::TransportError,
                        }
                    }
                    (base_cmd::DEVICE_WATCHDOG, false) => {
                        log::trace!("[{}] {}", peer.identity(), msg);
                    }
                    (base_cmd::DISCONNECT_PEER, true) => {
                        log::info!(
                            "[{}] peer disconnecting ({:?})",
                            peer.identity(),
                            base::disconnect_cause(&msg)
                        );
                        let _ = tx.send(ctx.local.disconnect_peer_answer(&msg)).await;
                        break CloseReason::Disconnected;
                    }
                    _ => {
                        log::warn!("[{}] unexpected {} while open", peer.identity(), msg);
                    }
                }
            }

            _ = &mut writer_task, if !writer_finished => {
                writer_finished = true;
                break CloseReason::TransportError;
            }
        }
    };

    match reason {
        CloseReason::Disconnected => {
            peer.apply(PeerInput::DisconnectRequested);
        }
        CloseReason::Stopped => {
            peer.apply(PeerInput::Stop);
            let dpr = ctx
                .local
                .disconnect_peer_request(&ctx.ids, DisconnectCause::Rebooting);
            let hop_by_hop_id = dpr.hop_by_hop_id();
            if !writer_finished && tx.send(dpr).await.is_ok() {
                let wait = timers.watchdog_answer_timeout().min(timers.shutdown_grace() / 2);
                wait_for_dpa(&mut reader, hop_by_hop_id, wait).await;
            }
        }
        CloseReason::TransportError => {
            peer.apply(PeerInput::TransportError);
        }
        CloseReason::ProtocolError => {
            peer.apply(PeerInput::ProtocolError);
        }
        CloseReason::WatchdogExpired => {
            peer.counters().inc_watchdog_expirations();
            log::warn!("[{}] watchdog expired, closing connection", peer.identity());
            peer.apply(PeerInput::WatchdogExpired);
            writer_task.abort();
        }
    }

    peer.detach();
    drop(tx);
    if !writer_finished
        && tokio::time::timeout(timers.shutdown_grace(), &mut writer_task)
            .await
            .is_err()
    {
        writer_task.abort();
    }

    peer.apply(PeerInput::Drained);
    ctx.peer_closed(peer);
    log::info!("[{}] peer closed ({:?})", peer.identity(), reason);
    reason
}

async fn wait_for_dpa(reader: &mut crate::transport::FrameReader, hop_by_hop_id: u32, wait: Duration) {
    let deadline = Instant::now() + wait;
    loop {
        match tokio::time::timeout_at(deadline, reader.recv()).await {
            Ok(Ok(msg))
                if msg.is_answer()
                    && msg.command_code() == base_cmd::DISCONNECT_PEER
                    && msg.hop_by_hop_id() == hop_by_hop_id =>
            {
                return
            }
            Ok(Ok(msg)) => log::trace!("discarding {} while closing", msg),
            Ok(Err(_)) | Err(_) => return,
        }
    }
}
