//! Head-block polling with sleep/wake power management.
//!
//! The poller is either Awake (an interval timer fetches the block number
//! every block time) or Asleep (no timer at all). It falls asleep once no
//! decision surface has had focus for the idle window, and wakes the moment
//! a surface gains focus or anyone calls [`BlockPoller::wake`].

use crate::error::RpcError;
use crate::rpc::EthereumClient;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Process-wide view of upstream health. Written only by the poller.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcConnectionStatus {
    pub connected: bool,
    pub retrying: bool,
    pub last_error: Option<String>,
    pub latest_block: Option<u64>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PollerState {
    Awake,
    Asleep,
}

struct Activity {
    state: PollerState,
    last_activity: Instant,
    focused: usize,
}

pub struct BlockPoller {
    client: Arc<EthereumClient>,
    interval: Duration,
    idle_window: Duration,
    activity: Mutex<Activity>,
    wake: Notify,
    status: watch::Sender<RpcConnectionStatus>,
    blocks: watch::Sender<u64>,
}

impl BlockPoller {
    pub fn new(client: Arc<EthereumClient>, interval: Duration, idle_window: Duration) -> Self {
        let (status, _) = watch::channel(RpcConnectionStatus::default());
        let (blocks, _) = watch::channel(0);
        Self {
            client,
            interval,
            idle_window,
            activity: Mutex::new(Activity {
                state: PollerState::Awake,
                last_activity: Instant::now(),
                focused: 0,
            }),
            wake: Notify::new(),
            status,
            blocks,
        }
    }

    pub fn status(&self) -> RpcConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<RpcConnectionStatus> {
        self.status.subscribe()
    }

    /// Latest observed block number; `0` until the first successful poll.
    pub fn subscribe_blocks(&self) -> watch::Receiver<u64> {
        self.blocks.subscribe()
    }

    pub fn latest_block(&self) -> Option<u64> {
        match *self.blocks.borrow() {
            0 => None,
            n => Some(n),
        }
    }

    /// Forget the head of the previous chain. The next poll publishes the
    /// new chain's head even if it is lower.
    pub fn reset_head(&self) {
        self.blocks.send_replace(0);
        self.status.send_modify(|status| status.latest_block = None);
    }

    pub fn state(&self) -> PollerState {
        self.activity.lock().unwrap_or_else(|e| e.into_inner()).state
    }

    /// Leave the Asleep state (or stay Awake) and re-arm the idle timer.
    /// The idle timer is re-armed before the loop runs its next check, so
    /// a wake never turns into an immediate re-sleep.
    pub fn wake(&self) {
        {
            let mut activity = self.activity.lock().unwrap_or_else(|e| e.into_inner());
            if activity.state == PollerState::Asleep {
                info!("Block poller waking up");
            }
            activity.state = PollerState::Awake;
            activity.last_activity = Instant::now();
        }
        self.wake.notify_one();
    }

    pub fn focus_gained(&self) {
        {
            let mut activity = self.activity.lock().unwrap_or_else(|e| e.into_inner());
            activity.focused += 1;
        }
        self.wake();
    }

    pub fn focus_lost(&self) {
        let mut activity = self.activity.lock().unwrap_or_else(|e| e.into_inner());
        activity.focused = activity.focused.saturating_sub(1);
        activity.last_activity = Instant::now();
    }

    /// Move to Asleep if nothing has held focus for the idle window.
    pub(crate) fn try_sleep(&self) -> bool {
        let mut activity = self.activity.lock().unwrap_or_else(|e| e.into_inner());
        if activity.focused == 0 && activity.last_activity.elapsed() >= self.idle_window {
            activity.state = PollerState::Asleep;
            true
        } else {
            false
        }
    }

    /// One poll: fetch the head block and update the connection status.
    pub async fn tick(&self) -> Result<u64, RpcError> {
        let result = self.client.block_number().await;
        match &result {
            Ok(number) => {
                let number = *number;
                self.status.send_modify(|status| {
                    status.connected = true;
                    status.retrying = false;
                    status.last_error = None;
                    status.latest_block = Some(number);
                    status.updated_at = Some(Utc::now());
                });
                let advanced = self.blocks.send_if_modified(|latest| {
                    if number > *latest {
                        *latest = number;
                        true
                    } else {
                        false
                    }
                });
                if advanced {
                    debug!(block = number, "New head block");
                }
            }
            Err(e) => {
                warn!(error = %e, transient = e.is_transient(), "Head block poll failed, will retry");
                let message = e.to_string();
                self.status.send_modify(|status| {
                    status.connected = false;
                    status.retrying = true;
                    status.last_error = Some(message);
                    status.updated_at = Some(Utc::now());
                });
            }
        }
        result
    }

    /// Drive the state machine forever.
    pub async fn run(self: Arc<Self>) {
        loop {
            while self.state() == PollerState::Asleep {
                self.wake.notified().await;
            }

            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if self.try_sleep() {
                    info!(idle_secs = self.idle_window.as_secs(), "Block poller going to sleep");
                    break;
                }
                // Failures are already recorded in the status.
                let _ = self.tick().await;
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::testing::{client, ScriptedTransport};
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    fn poller(transport: Arc<ScriptedTransport>) -> Arc<BlockPoller> {
        Arc::new(BlockPoller::new(
            Arc::new(client(transport)),
            Duration::from_secs(12),
            Duration::from_secs(24),
        ))
    }

    #[tokio::test]
    async fn test_failure_sets_retrying_and_success_clears_it() {
        let failing = Arc::new(AtomicBool::new(true));
        let flag = failing.clone();
        let transport = ScriptedTransport::new(move |_, _| {
            if flag.load(Ordering::SeqCst) {
                Err(RpcError::FailedToFetch("timeout".into()))
            } else {
                Ok(serde_json::json!("0x64"))
            }
        });
        let poller = poller(transport);

        assert!(poller.tick().await.is_err());
        let status = poller.status();
        assert!(status.retrying);
        assert!(!status.connected);
        assert!(status.last_error.is_some());

        failing.store(false, Ordering::SeqCst);
        assert_eq!(poller.tick().await.unwrap(), 100);
        let status = poller.status();
        assert!(!status.retrying);
        assert!(status.connected);
        assert_eq!(status.latest_block, Some(100));
        assert_eq!(poller.latest_block(), Some(100));
    }

    #[tokio::test]
    async fn test_block_watch_only_moves_forward() {
        let head = Arc::new(AtomicU64::new(10));
        let h = head.clone();
        let transport = ScriptedTransport::new(move |_, _| {
            Ok(serde_json::json!(format!("{:#x}", h.load(Ordering::SeqCst))))
        });
        let poller = poller(transport);
        let blocks = poller.subscribe_blocks();

        poller.tick().await.unwrap();
        assert_eq!(*blocks.borrow(), 10);
        head.store(9, Ordering::SeqCst);
        poller.tick().await.unwrap();
        assert_eq!(*blocks.borrow(), 10);
    }

    #[tokio::test]
    async fn test_reset_head_accepts_a_lower_chain() {
        let head = Arc::new(AtomicU64::new(500));
        let h = head.clone();
        let transport = ScriptedTransport::new(move |_, _| {
            Ok(serde_json::json!(format!("{:#x}", h.load(Ordering::SeqCst))))
        });
        let poller = poller(transport);
        poller.tick().await.unwrap();

        poller.reset_head();
        assert_eq!(poller.latest_block(), None);
        assert_eq!(poller.status().latest_block, None);
        head.store(3, Ordering::SeqCst);
        poller.tick().await.unwrap();
        assert_eq!(poller.latest_block(), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleeps_when_idle_and_wake_polls_once() {
        let transport = ScriptedTransport::new(|_, _| Ok(serde_json::json!("0x1")));
        let poller = poller(transport.clone());
        tokio::spawn(poller.clone().run());

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(transport.calls("eth_blockNumber"), 1);

        tokio::time::sleep(Duration::from_secs(12)).await;
        assert_eq!(transport.calls("eth_blockNumber"), 2);

        // Idle window elapses at the t=24s tick.
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert_eq!(poller.state(), PollerState::Asleep);
        assert_eq!(transport.calls("eth_blockNumber"), 2);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(transport.calls("eth_blockNumber"), 2);

        poller.wake();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(poller.state(), PollerState::Awake);
        assert_eq!(transport.calls("eth_blockNumber"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_focus_keeps_poller_awake() {
        let transport = ScriptedTransport::new(|_, _| Ok(serde_json::json!("0x1")));
        let poller = poller(transport.clone());
        poller.focus_gained();
        tokio::spawn(poller.clone().run());

        tokio::time::sleep(Duration::from_secs(60) + Duration::from_millis(1)).await;
        assert_eq!(poller.state(), PollerState::Awake);
        assert_eq!(transport.calls("eth_blockNumber"), 6);

        poller.focus_lost();
        tokio::time::sleep(Duration::from_secs(36)).await;
        assert_eq!(poller.state(), PollerState::Asleep);
    }
}
