use std::{
    net::SocketAddr,
    sync::mpsc::{self, Receiver, Sender},
    thread,
};

use serde::Deserialize;
use tracing::{debug, warn};

/// One lookupd response, marshalled back onto the coordinator thread. The
/// worker thread that fetches this never touches Reader state directly —
/// it only ever sends results across the channel for the coordinator to
/// apply on its next poll tick.
pub struct DiscoveryResult {
    pub endpoint: String,
    pub producers: Vec<SocketAddr>,
}

#[derive(Deserialize)]
struct LookupResponse {
    #[serde(default)]
    producers: Vec<Producer>,
}

#[derive(Deserialize)]
struct Producer {
    broadcast_address: Option<String>,
    address: Option<String>,
    tcp_port: u16,
}

/// Polls lookupd endpoints for a topic on a dedicated thread, sending each
/// response back over `results`. One `DiscoveryClient` per `Reader`, and
/// one shared HTTP client underneath for connection pooling across every
/// query it issues.
pub struct DiscoveryClient {
    tx: Sender<DiscoveryQuery>,
}

struct DiscoveryQuery {
    endpoint: String,
    topic: String,
}

impl DiscoveryClient {
    pub fn spawn(results: Sender<DiscoveryResult>) -> Self {
        let (tx, rx) = mpsc::channel::<DiscoveryQuery>();
        thread::Builder::new()
            .name("nsq-lookupd-poll".into())
            .spawn(move || worker_loop(rx, results))
            .expect("failed to spawn lookupd polling thread");
        Self { tx }
    }

    /// Queues a lookup for `topic` against `endpoint`; the result arrives
    /// asynchronously on the channel passed to `spawn`.
    pub fn query(&self, endpoint: &str, topic: &str) {
        let _ = self.tx.send(DiscoveryQuery { endpoint: endpoint.to_owned(), topic: topic.to_owned() });
    }
}

fn worker_loop(rx: Receiver<DiscoveryQuery>, results: Sender<DiscoveryResult>) {
    let client = reqwest::blocking::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(1))
        .timeout(std::time::Duration::from_secs(2))
        .build()
        .expect("failed to build lookupd HTTP client");

    while let Ok(query) = rx.recv() {
        let producers = fetch_producers(&client, &query.endpoint, &query.topic);
        if results.send(DiscoveryResult { endpoint: query.endpoint, producers }).is_err() {
            break;
        }
    }
}

fn fetch_producers(client: &reqwest::blocking::Client, endpoint: &str, topic: &str) -> Vec<SocketAddr> {
    let url = format!("{}/lookup?topic={}", endpoint.trim_end_matches('/'), url::form_urlencoded::byte_serialize(topic.as_bytes()).collect::<String>());

    let response = match client
        .get(&url)
        .header("Accept", "application/vnd.nsq; version=1.0")
        .send()
    {
        Ok(resp) => resp,
        Err(err) => {
            warn!(%endpoint, %err, "lookupd query failed");
            return Vec::new();
        }
    };

    let parsed: LookupResponse = match response.json() {
        Ok(body) => body,
        Err(err) => {
            warn!(%endpoint, %err, "lookupd response was not valid JSON");
            return Vec::new();
        }
    };

    parsed
        .producers
        .into_iter()
        .filter_map(|p| {
            let host = p.broadcast_address.or(p.address)?;
            format!("{host}:{}", p.tcp_port).parse().ok()
        })
        .inspect(|addr| debug!(%endpoint, %addr, "lookupd returned producer"))
        .collect()
}
