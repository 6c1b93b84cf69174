use std::{
    collections::{HashMap, HashSet, VecDeque},
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::explorer::{EsploraTx, Explorer};

/// Delivered txids remembered per address; far above one Esplora page.
const SEEN_CAPACITY: usize = 1024;

struct MonitorTask {
    handle: JoinHandle<()>,
    seen: Arc<Mutex<Seen>>,
}

impl MonitorTask {
    fn is_live(&self) -> bool {
        !self.handle.is_finished()
    }
}

/// Txids already handed to the callback, oldest evicted first.
#[derive(Default)]
struct Seen {
    last: Option<String>,
    ids: HashSet<String>,
    order: VecDeque<String>,
}

impl Seen {
    fn contains(&self, txid: &str) -> bool {
        self.ids.contains(txid)
    }

    fn record(&mut self, txid: String) {
        if self.ids.insert(txid.clone()) {
            self.order.push_back(txid.clone());
            if self.order.len() > SEEN_CAPACITY {
                if let Some(old) = self.order.pop_front() {
                    self.ids.remove(&old);
                }
            }
        }
        self.last = Some(txid);
    }
}

/// Polls watched addresses for new transactions. One task per address;
/// tasks run until `stop`/`stop_all` cancels them.
pub struct AddressMonitor {
    explorer: Explorer,
    interval: Duration,
    tasks: Mutex<HashMap<String, MonitorTask>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl AddressMonitor {
    pub fn new(explorer: Explorer, interval: Duration) -> Self {
        Self {
            explorer,
            interval,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Returns false without doing anything if `address` is already watched.
    /// A task that ended on its own (a panicking callback) is replaced.
    pub fn watch<F, Fut>(&self, address: &str, on_transaction: F) -> bool
    where
        F: Fn(EsploraTx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = lock(&self.tasks);
        match tasks.get(address) {
            Some(task) if task.is_live() => {
                debug!("{address} already watched");
                return false;
            }
            Some(_) => warn!("monitor for {address} had died, restarting"),
            None => {}
        }

        let seen = Arc::new(Mutex::new(Seen::default()));
        let handle = tokio::spawn(poll_loop(
            self.explorer.clone(),
            address.to_owned(),
            self.interval,
            seen.clone(),
            on_transaction,
        ));
        tasks.insert(address.to_owned(), MonitorTask { handle, seen });
        info!("watching {address} every {:?}", self.interval);
        true
    }

    /// Cancel and join the task for `address`. False if it wasn't watched.
    pub async fn stop(&self, address: &str) -> bool {
        let task = lock(&self.tasks).remove(address);
        let Some(task) = task else {
            return false;
        };
        task.handle.abort();
        let _ = task.handle.await;
        info!("stopped watching {address}");
        true
    }

    pub async fn stop_all(&self) {
        let drained: Vec<(String, MonitorTask)> = lock(&self.tasks).drain().collect();
        for (_, task) in &drained {
            task.handle.abort();
        }
        for (address, task) in drained {
            let _ = task.handle.await;
            debug!("stopped watching {address}");
        }
    }

    pub fn is_watching(&self, address: &str) -> bool {
        lock(&self.tasks).get(address).is_some_and(MonitorTask::is_live)
    }

    pub fn active_count(&self) -> usize {
        lock(&self.tasks).values().filter(|t| t.is_live()).count()
    }

    pub fn last_seen(&self, address: &str) -> Option<String> {
        lock(&self.tasks)
            .get(address)
            .and_then(|t| lock(&t.seen).last.clone())
    }
}

async fn poll_loop<F, Fut>(
    explorer: Explorer,
    address: String,
    interval: Duration,
    seen: Arc<Mutex<Seen>>,
    on_transaction: F,
) where
    F: Fn(EsploraTx) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let txs = match explorer.address_transactions(&address).await {
            Ok(txs) => txs,
            Err(e) => {
                warn!("polling {address} failed: {e}");
                continue;
            }
        };

        let fresh = unseen(&txs, &lock(&seen));
        for tx in fresh.into_iter().rev() {
            let txid = tx.txid.clone();
            on_transaction(tx.clone()).await;
            lock(&seen).record(txid);
        }
    }
}

/// Undelivered transactions of a newest-first list, order kept. Replaced
/// or reordered entries never bring back ones already delivered.
fn unseen<'a>(txs: &'a [EsploraTx], seen: &Seen) -> Vec<&'a EsploraTx> {
    txs.iter().filter(|t| !seen.contains(&t.txid)).collect()
}
