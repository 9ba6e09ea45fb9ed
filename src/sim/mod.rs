//! In-process session simulation.
//!
//! Runs one host and several clients over `tokio::io::duplex` pipes carrying
//! length-prefixed frames. Host-to-peer frames can be dropped at a seeded
//! rate so resend and resync paths get exercised. When the run settles the
//! report says whether every client converged on the host's roster and chat
//! log.

pub mod link;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use log::info;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, interval, sleep, sleep_until};

use crate::config::{Settings, SimSettings};
use crate::observability::init_metrics;
use crate::registry::{CHATLOG, NetObjectRegistry, ROSTER};
use crate::session::{ClientSession, HostSession, MemoryRoster};

pub use link::{HostLink, LinkEvent, SimLink, read_loop, write_loop};

const HOST_ID: &str = "host";
const PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Clone, Serialize)]
pub struct SimReport {
	pub peers: usize,
	pub chats_sent: usize,
	pub frames_dropped: u64,
	pub converged: bool,
	/// Peers whose copy of a built-in object differs from the host's.
	pub diverged: Vec<String>,
	/// Final host revision per object.
	pub revisions: BTreeMap<String, u64>,
	#[serde(skip)]
	pub host_metrics: String,
	#[serde(skip)]
	pub client_metrics: String,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
	match deadline {
		Some(deadline) => sleep_until(deadline).await,
		None => std::future::pending().await,
	}
}

async fn host_loop(
	mut host: HostSession<SimLink>,
	mut inbound: mpsc::UnboundedReceiver<LinkEvent>,
	mut shutdown: watch::Receiver<bool>,
) -> HostSession<SimLink> {
	loop {
		let deadline = host.next_deadline();
		tokio::select! {
			event = inbound.recv() => match event {
				Some((peer, Some(envelope))) => {
					host.handle_message(&peer, envelope);
				}
				Some((peer, None)) => {
					host.transport_mut().remove_peer(&peer);
					host.on_peer_disconnected(&peer);
				}
				None => break,
			},
			_ = sleep_until_opt(deadline) => {
				host.poll();
			}
			_ = shutdown.changed() => break,
		}
	}
	host
}

struct ClientRun {
	peer: String,
	session: ClientSession<HostLink>,
	chats_sent: usize,
}

async fn client_loop(
	peer: String,
	mut session: ClientSession<HostLink>,
	mut inbound: mpsc::UnboundedReceiver<LinkEvent>,
	sim: SimSettings,
	mut shutdown: watch::Receiver<bool>,
) -> ClientRun {
	let name = format!("Sim {}", peer);
	session.hello(Some(&peer), &name);
	session.start();

	let mut tick = interval(Duration::from_millis(sim.message_interval_ms.max(1)));
	let mut chats_sent = 0;
	loop {
		let deadline = session.next_deadline();
		tokio::select! {
			event = inbound.recv() => match event {
				Some((_, Some(envelope))) => {
					session.handle_message(envelope);
				}
				_ => break,
			},
			_ = tick.tick(), if chats_sent < sim.messages => {
				chats_sent += 1;
				session.chat(&format!("message {} from {}", chats_sent, peer));
			}
			_ = sleep_until_opt(deadline) => {
				session.poll();
			}
			_ = shutdown.changed() => break,
		}
	}

	ClientRun {
		peer,
		session,
		chats_sent,
	}
}

/// Run one simulated session to completion.
pub async fn run(settings: &Settings) -> anyhow::Result<SimReport> {
	let sim = settings.sim.clone();
	if !(0.0..1.0).contains(&sim.drop_rate) {
		bail!("drop rate must be in [0, 1), got {}", sim.drop_rate);
	}

	let registry = Arc::new(NetObjectRegistry::with_builtins());
	let host_metrics = init_metrics().context("host metrics")?;
	let client_metrics = init_metrics().context("client metrics")?;

	let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
	let (shutdown_tx, shutdown_rx) = watch::channel(false);
	let mut link = SimLink::new(sim.drop_rate, sim.seed);
	let mut clients = Vec::with_capacity(sim.peers);

	for n in 1..=sim.peers {
		let peer = format!("peer-{}", n);
		let (host_io, client_io) = tokio::io::duplex(PIPE_CAPACITY);
		let (host_read, host_write) = tokio::io::split(host_io);
		let (client_read, client_write) = tokio::io::split(client_io);

		let (to_peer, from_host) = mpsc::unbounded_channel();
		link.add_peer(peer.clone(), to_peer);
		tokio::spawn(write_loop(host_write, from_host));
		tokio::spawn(read_loop(host_read, peer.clone(), inbound_tx.clone()));

		let (to_host, outbound) = mpsc::unbounded_channel();
		let (client_tx, client_rx) = mpsc::unbounded_channel();
		tokio::spawn(write_loop(client_write, outbound));
		tokio::spawn(read_loop(client_read, HOST_ID.to_string(), client_tx));

		let session = ClientSession::new(Arc::clone(&registry), HostLink::new(to_host), settings)
			.with_metrics(Arc::clone(&client_metrics));
		clients.push(tokio::spawn(client_loop(
			peer,
			session,
			client_rx,
			sim.clone(),
			shutdown_rx.clone(),
		)));
	}
	drop(inbound_tx);

	let host = HostSession::new(Arc::clone(&registry), link, Box::new(MemoryRoster::new()), settings)
		.with_metrics(Arc::clone(&host_metrics));
	let host_task = tokio::spawn(host_loop(host, inbound_rx, shutdown_rx));
	info!(
		"simulating {} peers, {} messages each, drop rate {}",
		sim.peers, sim.messages, sim.drop_rate
	);

	let traffic = Duration::from_millis(sim.message_interval_ms.saturating_mul(sim.messages as u64));
	sleep(traffic + Duration::from_millis(sim.settle_ms)).await;
	// Tasks that already exited have dropped their receivers.
	let _ = shutdown_tx.send(true);

	let host = host_task.await.context("host task failed")?;
	let mut runs = Vec::with_capacity(clients.len());
	for client in clients {
		runs.push(client.await.context("client task failed")?);
	}

	let mut diverged = Vec::new();
	for run in &runs {
		let matches = [ROSTER, CHATLOG].iter().all(|id| {
			run.session.store().get(id).map(|s| &s.value) == host.replicator().get(id).map(|s| &s.value)
		});
		if !matches {
			diverged.push(run.peer.clone());
		}
	}

	let revisions = registry
		.descriptors()
		.filter_map(|d| host.replicator().revision(&d.id).map(|rev| (d.id.clone(), rev)))
		.collect();

	let report = SimReport {
		peers: runs.len(),
		chats_sent: runs.iter().map(|r| r.chats_sent).sum(),
		frames_dropped: host.transport().dropped(),
		converged: diverged.is_empty(),
		diverged,
		revisions,
		host_metrics: host_metrics.encode(),
		client_metrics: client_metrics.encode(),
	};
	info!(
		"simulation finished: converged={} dropped={} chats={}",
		report.converged, report.frames_dropped, report.chats_sent
	);
	Ok(report)
}
