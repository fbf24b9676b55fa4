//! The wait between the door unit acknowledging `start_stream` and the
//! decoder being pointed at the feed.  The door unit only serves frames a
//! little after it acks, so opening the stream immediately races its startup.

use std::time::Duration;

use doorcam_proto::config::{Readiness, SessionConfig};
use tracing::debug;

/// Lower bound on a single probe request, so a short probe interval still
/// leaves room for the first frame to arrive.
const MIN_PROBE_REQUEST: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub enum Settle {
    /// Blind delay.
    Fixed(Duration),
    /// Poll the stream URL until it yields a first body chunk.
    Probe {
        url: String,
        interval: Duration,
        client: reqwest::Client,
    },
}

impl Settle {
    pub fn from_config(session: &SessionConfig, stream_url: &str) -> anyhow::Result<Self> {
        Ok(match session.readiness {
            Readiness::Fixed => Settle::Fixed(session.settle()),
            Readiness::Probe => Settle::Probe {
                url: stream_url.to_string(),
                interval: session.probe_interval(),
                client: reqwest::Client::builder().build()?,
            },
        })
    }

    /// Returns once the feed should be openable.  Never fails; an unready
    /// stream keeps it waiting, and the caller's start deadline bounds it.
    pub async fn wait(&self) {
        match self {
            Settle::Fixed(delay) => tokio::time::sleep(*delay).await,
            Settle::Probe {
                url,
                interval,
                client,
            } => {
                let mut attempt = 0u32;
                loop {
                    attempt += 1;
                    if probe_once(client, url, (*interval).max(MIN_PROBE_REQUEST)).await {
                        debug!("readiness: stream up after {} probe(s)", attempt);
                        return;
                    }
                    tokio::time::sleep(*interval).await;
                }
            }
        }
    }
}

async fn probe_once(client: &reqwest::Client, url: &str, bound: Duration) -> bool {
    let probe = async {
        let mut response = client.get(url).send().await.ok()?;
        if !response.status().is_success() {
            debug!("readiness: {} answered {}", url, response.status());
            return None;
        }
        // Headers go out before the first frame; only a body chunk proves
        // the camera is actually feeding the stream.
        response.chunk().await.ok().flatten()
    };
    matches!(tokio::time::timeout(bound, probe).await, Ok(Some(_)))
}
