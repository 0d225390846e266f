mod adapters;

use std::collections::HashMap;
use std::io::stderr;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;

use clap::Parser;

use futures::{SinkExt, StreamExt};

use hyper::body::Incoming;
use hyper::server::conn::http1 as conn;
use hyper::service::service_fn;
use hyper::{header, Method, Request, Response, StatusCode, Version};

use hyper_util::rt::TokioIo;

use serde_json::json;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;

use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::{Message, Role};
use tokio_tungstenite::WebSocketStream;

use tracing::{debug, error, info, instrument, warn};

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::FmtSubscriber;

use bars_hub::{
	is_valid_airport, AcceptError, DispatchAction, Hub, HeartbeatAction, HubConfig,
	HubRegistry, Ports, SessionId,
};
use bars_protocol::{decode_inbound, Downstream};

use adapters::{EmptyCatalogue, FileCatalogue, FileStateStore, InMemoryStateStore, StaticDirectory, TracingAnalyticsSink};

/// Serve a local BARS stopbar hub.
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
	/// accept KEY as a controller API key
	#[arg(short = 'c', long = "controller", value_name = "KEY")]
	controller_keys: Vec<String>,

	/// accept KEY as an observer API key
	#[arg(short = 'o', long = "observer", value_name = "KEY")]
	observer_keys: Vec<String>,

	/// accept KEY as a pilot API key
	#[arg(short = 'p', long = "pilot", value_name = "KEY")]
	pilot_keys: Vec<String>,

	/// load the offline Point Catalogue from FILE
	#[arg(long = "catalogue", value_name = "FILE")]
	catalogue: Option<PathBuf>,

	/// persist Hub state under DIR instead of keeping it in memory only
	#[arg(long = "state-dir", value_name = "DIR")]
	state_dir: Option<PathBuf>,

	/// override the Hub's tunables from a TOML FILE
	#[arg(long = "config", value_name = "FILE")]
	config: Option<PathBuf>,

	/// bind server to ADDRESS
	#[arg(value_name = "ADDRESS")]
	bind: SocketAddr,
}

async fn load_config(path: Option<&PathBuf>) -> Result<HubConfig> {
	let Some(path) = path else { return Ok(HubConfig::default()) };
	let raw = tokio::fs::read_to_string(path).await?;
	Ok(toml::from_str(&raw)?)
}

#[tokio::main]
async fn main() -> Result<()> {
	let args = Args::parse();

	let subscriber = FmtSubscriber::builder()
		.with_ansi(true)
		.with_level(true)
		.with_max_level(LevelFilter::TRACE)
		.with_timer(ChronoUtc::new("%TZ".into()))
		.with_writer(stderr)
		.finish();

	tracing::subscriber::set_global_default(subscriber)?;

	info!("logging initialised");

	let config = load_config(args.config.as_ref()).await?;
	info!(?config, "hub configuration loaded");

	let directory = Arc::new(StaticDirectory::new(
		args.controller_keys,
		args.observer_keys,
		args.pilot_keys,
	));

	let catalogue: Arc<dyn bars_hub::PointCatalogue> = match args.catalogue {
		Some(path) => Arc::new(FileCatalogue::load(&path)?),
		None => Arc::new(EmptyCatalogue),
	};

	let store: Arc<dyn bars_hub::DurableStateStore> = match args.state_dir {
		Some(dir) => Arc::new(FileStateStore::new(dir)),
		None => Arc::new(InMemoryStateStore::default()),
	};

	let ports = Arc::new(Ports {
		identity: directory.clone(),
		keys: directory,
		catalogue,
		store,
		analytics: Arc::new(TracingAnalyticsSink),
	});

	let registry = Arc::new(HubRegistry::new(ports.clone(), Arc::new(config)));

	{
		let registry = registry.clone();
		tokio::spawn(async move {
			let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
			loop {
				interval.tick().await;
				registry.shutdown_idle().await;
			}
		});
	}

	let listener = TcpListener::bind(args.bind).await?;
	info!(bind = %args.bind, "listening");

	loop {
		let (stream, remote) = listener.accept().await?;

		let stream = TokioIo::new(stream);
		let registry = registry.clone();
		let ports = ports.clone();

		debug!("accepted {remote}");

		tokio::spawn(async move {
			let service =
				service_fn(move |req| handle(req, registry.clone(), ports.clone()));
			let conn = conn::Builder::new()
				.serve_connection(stream, service)
				.with_upgrades();

			if let Err(err) = conn.await {
				error!("failed to serve: {err}");
			} else {
				debug!("closed {remote}");
			}
		});
	}
}

#[instrument(skip_all)]
async fn handle(
	req: Request<Incoming>,
	registry: Arc<HubRegistry>,
	ports: Arc<Ports>,
) -> Result<Response<String>> {
	debug!("{} {}", req.method(), req.uri().path());

	Ok(match req.uri().path() {
		"/connect" => handle_connect(req, registry, ports).await?,
		"/state" => handle_state(&req, &registry).await?,
		path => {
			warn!("not found: {path}");

			Response::builder()
				.status(StatusCode::NOT_FOUND)
				.body("not found".into())?
		},
	})
}

fn query_params(req: &Request<Incoming>) -> HashMap<&str, &str> {
	req.uri()
		.query()
		.map(|query| {
			query
				.split('&')
				.filter_map(|tuple| tuple.split_once('='))
				.collect()
		})
		.unwrap_or_default()
}

async fn handle_connect(
	req: Request<Incoming>,
	registry: Arc<HubRegistry>,
	ports: Arc<Ports>,
) -> Result<Response<String>> {
	let Some(accept_key) = get_websocket_request(&req) else {
		return Ok(Response::builder()
			.status(StatusCode::BAD_REQUEST)
			.body("not a websocket upgrade request".into())?)
	};

	let params = query_params(&req);
	let airport = params.get("airport").map(|s| s.to_string());
	let api_key = params.get("key").copied();

	let Some(airport) = airport else {
		bars_hub::anti_enumeration_delay().await;
		return Ok(Response::builder()
			.status(StatusCode::UNAUTHORIZED)
			.body("unauthenticated".into())?)
	};

	if !is_valid_airport(&airport) {
		return Ok(Response::builder()
			.status(StatusCode::BAD_REQUEST)
			.body("invalid_airport".into())?)
	}

	match bars_hub::authenticate(&ports, api_key).await {
		Ok((user_id, kind)) => {
			tokio::spawn(async move {
				match hyper::upgrade::on(req).await {
					Ok(stream) => {
						let hub = match registry.route(&airport).await {
							Ok(hub) => hub,
							Err(err) => {
								error!("failed to route {airport}: {err}");
								return
							},
						};

						let stream = TokioIo::new(stream);
						let conn =
							WebSocketStream::from_raw_socket(stream, Role::Server, None)
								.await;

						if let Err(err) = handle_socket(conn, hub, user_id, kind).await {
							error!("handling error: {err}");
						}
					},
					Err(err) => error!("failed to upgrade: {err}"),
				}
			});

			Response::builder()
				.status(StatusCode::SWITCHING_PROTOCOLS)
				.header(header::CONNECTION, "upgrade")
				.header(header::UPGRADE, "websocket")
				.header(header::SEC_WEBSOCKET_ACCEPT, accept_key)
				.body("".into())
				.map_err(Into::into)
		},
		Err(AcceptError::Unauthenticated) => Response::builder()
			.status(StatusCode::UNAUTHORIZED)
			.body("unauthenticated".into())
			.map_err(Into::into),
		Err(AcceptError::Forbidden(reason)) => Response::builder()
			.status(StatusCode::FORBIDDEN)
			.body(reason.into())
			.map_err(Into::into),
		Err(AcceptError::InvalidAirport) => Response::builder()
			.status(StatusCode::BAD_REQUEST)
			.body("invalid_airport".into())
			.map_err(Into::into),
	}
}

async fn handle_state(
	req: &Request<Incoming>,
	registry: &HubRegistry,
) -> Result<Response<String>> {
	if req.method() != Method::GET {
		return Ok(Response::builder()
			.status(StatusCode::BAD_REQUEST)
			.body("bad request".into())?)
	}

	let params = query_params(req);
	let airport = params.get("airport").map(|s| s.to_string());
	let offline_forced = params.get("offline").map(|v| *v == "true").unwrap_or(false);

	let Some(airport) = airport else {
		return Ok(Response::builder()
			.status(StatusCode::BAD_REQUEST)
			.body("bad request".into())?)
	};

	if airport == "all" {
		let entries = registry.list_active().await;
		return Ok(Response::builder()
			.header(header::CONTENT_TYPE, "application/json")
			.body(serde_json::to_string(&json!({ "hubs": entries }))?)?)
	}

	match registry.get_state_snapshot(&airport, offline_forced).await {
		Ok(snapshot) => Ok(Response::builder()
			.header(header::CONTENT_TYPE, "application/json")
			.body(serde_json::to_string(&snapshot)?)?),
		Err(_) => Ok(Response::builder()
			.status(StatusCode::BAD_REQUEST)
			.body("invalid_airport".into())?),
	}
}

fn get_websocket_request(req: &Request<Incoming>) -> Option<String> {
	let is_websocket_request = req.method() == Method::GET
		&& req.version() >= Version::HTTP_11
		&& req
			.headers()
			.get(header::CONNECTION)
			.and_then(|v| v.to_str().ok())
			.map(|v| v.eq_ignore_ascii_case("upgrade"))
			.unwrap_or(false)
		&& req
			.headers()
			.get(header::UPGRADE)
			.and_then(|v| v.to_str().ok())
			.map(|v| {
				v.split([' ', ','])
					.any(|protocol| protocol.eq_ignore_ascii_case("websocket"))
			})
			.unwrap_or(false)
		&& req
			.headers()
			.get(header::SEC_WEBSOCKET_VERSION)
			.map(|v| v == "13")
			.unwrap_or(false);

	is_websocket_request
		.then(|| req.headers().get(header::SEC_WEBSOCKET_KEY))
		.flatten()
		.map(|key| derive_accept_key(key.as_bytes()))
}

#[instrument(skip_all, fields(user_id = %user_id))]
async fn handle_socket<S>(
	mut conn: WebSocketStream<S>,
	hub: Arc<Hub>,
	user_id: String,
	kind: bars_protocol::ClientKind,
) -> Result<()>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	async fn send<S>(conn: &mut WebSocketStream<S>, frame: &bars_protocol::Frame) -> Result<()>
	where
		S: AsyncRead + AsyncWrite + Unpin,
	{
		if let Err(err) = conn.send(frame.to_json_string().into()).await {
			error!("failed to send websocket message: {err}");
			let _ = conn.close(None).await;
			Err(err)?
		} else {
			Ok(())
		}
	}

	let (session_id, initial_state) = hub.connect(user_id, kind).await;

	send(&mut conn, &initial_state.into_frame(Some(hub.airport.clone()), bars_hub::now_ms())).await?;

	let mut rx = hub.subscribe();
	let mut heartbeat = tokio::time::interval(hub.heartbeat_interval());
	heartbeat.tick().await; // the first tick fires immediately

	let result = run_socket_loop(&mut conn, &hub, session_id, kind, &mut rx, &mut heartbeat).await;

	hub.disconnect(session_id).await;

	result
}

async fn run_socket_loop<S>(
	conn: &mut WebSocketStream<S>,
	hub: &Arc<Hub>,
	session_id: SessionId,
	kind: bars_protocol::ClientKind,
	rx: &mut tokio::sync::broadcast::Receiver<bars_hub::BroadcastMessage>,
	heartbeat: &mut tokio::time::Interval,
) -> Result<()>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	let airport = hub.airport.clone();
	async fn send<S>(conn: &mut WebSocketStream<S>, frame: &bars_protocol::Frame) -> Result<()>
	where
		S: AsyncRead + AsyncWrite + Unpin,
	{
		if let Err(err) = conn.send(frame.to_json_string().into()).await {
			error!("failed to send websocket message: {err}");
			let _ = conn.close(None).await;
			Err(err)?
		} else {
			Ok(())
		}
	}

	loop {
		tokio::select! {
			Ok(message) = rx.recv() => {
				if message.is_for(session_id, kind) {
					send(conn, &message.downstream.into_frame(Some(airport.to_string()), bars_hub::now_ms())).await?;
				}
			},
			_ = heartbeat.tick() => {
				match hub.heartbeat_tick(session_id).await {
					HeartbeatAction::SendHeartbeat => {
						send(conn, &Downstream::Heartbeat.into_frame(Some(airport.to_string()), bars_hub::now_ms())).await?;
					},
					HeartbeatAction::Close { error, reason } => {
						debug!("closing for {reason}");
						if let Some(error) = error {
							send(conn, &error.into_frame(Some(airport.to_string()), bars_hub::now_ms())).await?;
						}
						conn.close(None).await?;
						return Ok(())
					},
				}
			},
			message = conn.next() => {
				match message {
					Some(Ok(Message::Text(text))) => {
						match decode_inbound(&text, &hub.wire_limits()) {
							Ok((_airport_override, upstream)) => {
								match hub.dispatch(session_id, upstream).await {
									DispatchAction::None => (),
									DispatchAction::Send(downstream) => {
										send(conn, &downstream.into_frame(Some(airport.to_string()), bars_hub::now_ms())).await?;
									},
									DispatchAction::Close => {
										debug!("closing websocket at peer request");
										conn.close(None).await?;
										return Ok(())
									},
								}
							},
							Err(err) => {
								send(conn, &Hub::error_for(err).into_frame(Some(airport.to_string()), bars_hub::now_ms())).await?;
							},
						}
					},
					Some(Ok(Message::Close(_))) | None => {
						debug!("peer closed the websocket");
						return Ok(())
					},
					Some(Ok(Message::Binary(_) | Message::Frame(_))) => {
						warn!("non-text message received");
						send(conn, &Downstream::Error {
							message: "invalid websocket frame".into(),
						}.into_frame(Some(airport.to_string()), bars_hub::now_ms())).await?;
					},
					Some(Ok(Message::Ping(_) | Message::Pong(_))) => (),
					Some(Err(err)) => {
						error!("websocket error: {err}");
						let _ = conn.close(None).await;
						return Ok(())
					},
				}
			},
		}
	}
}

