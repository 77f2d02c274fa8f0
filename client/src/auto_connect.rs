use std::time::Duration;

use relaydropx_common::TransferError;
use tokio::{task::JoinHandle, time::sleep};
use tracing::debug;

use crate::{ClientSession, ConnectionState};

/// Keeps `session` attached to one of `candidates`.
///
/// Every `interval`, while the session is disconnected, the candidates are
/// tried in order until one accepts, which is then asked for its roster.
/// Failed attempts surface as the usual `Disconnected` events. Abort the
/// returned handle to stop.
pub fn spawn_auto_connect(
    session: ClientSession,
    candidates: Vec<String>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if session.state() == ConnectionState::Disconnected {
                for server in &candidates {
                    match session.connect(server).await {
                        Ok(()) => {
                            if let Err(e) = session.request_roster().await {
                                debug!("Roster request failed: {}", e);
                            }
                            break;
                        }
                        Err(TransferError::AlreadyConnected(_)) => break,
                        Err(e) => {
                            debug!("Auto-connect to {} failed: {}", server, e)
                        }
                    }
                }
            }
            sleep(interval).await;
        }
    })
}
