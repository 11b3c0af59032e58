//! Event Bridge
//!
//! Translates UI control events into engine injections.
//!
//! With a zero debounce window every event is injected immediately. With a
//! non-zero window the latest value of each control is held until the control
//! has been quiet for the whole window, then released as one batch. Dragging a
//! slider therefore produces one pass for the value it settles on rather than
//! one per intermediate position.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

use super::runtime::Engine;
use super::scheduler::{ChangeBatch, PassReport};
use crate::error::{GraphError, GraphResult};

#[derive(Debug, Clone)]
struct HeldEvent {
    value: Value,
    last_event: Instant,
    events: u32,
}

/// Routes control changes into an [`Engine`].
#[derive(Debug, Clone)]
pub struct EventBridge {
    engine: Engine,
    debounce: Duration,
    held: Arc<DashMap<String, HeldEvent>>,
}

impl EventBridge {
    /// Bridge using the engine's configured debounce window.
    pub fn new(engine: Engine) -> Self {
        let debounce = engine.config().debounce();
        Self {
            engine,
            debounce,
            held: Arc::new(DashMap::new()),
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    /// A control now holds `value`.
    ///
    /// Returns the passes run by this call: the pass for this change when
    /// events are forwarded immediately, nothing while they are being held.
    pub fn on_control_changed(&self, control: &str, value: Value) -> GraphResult<Vec<PassReport>> {
        let graph = self.engine.graph();
        if let Some(producer) = graph.producer(control) {
            return Err(GraphError::NotInjectable {
                variable: control.to_string(),
                producer: graph.cell_name(producer).to_string(),
            });
        }

        if self.debounce.is_zero() {
            trace!(control, "forwarding control event");
            return self.engine.inject(control, value);
        }

        let now = Instant::now();
        match self.held.entry(control.to_string()) {
            Entry::Occupied(mut entry) => {
                let held = entry.get_mut();
                held.value = value;
                held.last_event = now;
                held.events += 1;
            }
            Entry::Vacant(entry) => {
                entry.insert(HeldEvent {
                    value,
                    last_event: now,
                    events: 1,
                });
            }
        }
        trace!(control, "holding control event");
        Ok(Vec::new())
    }

    /// Release every control that has been quiet for the debounce window as
    /// of `now`, and run the resulting pass.
    pub fn flush_settled(&self, now: Instant) -> Vec<PassReport> {
        let debounce = self.debounce;
        let candidates: Vec<String> = self
            .held
            .iter()
            .filter(|entry| now.saturating_duration_since(entry.last_event) >= debounce)
            .map(|entry| entry.key().clone())
            .collect();

        let mut batch = ChangeBatch::new();
        for name in candidates {
            // An event may have landed since the scan; only take it if it
            // is still settled.
            if let Some((name, held)) = self.held.remove_if(&name, |_, held| {
                now.saturating_duration_since(held.last_event) >= debounce
            }) {
                if held.events > 1 {
                    debug!(control = %name, events = held.events, "coalesced control events");
                }
                batch.inject(name, held.value);
            }
        }
        self.release(batch)
    }

    /// Release everything held, regardless of age.
    pub fn flush_all(&self) -> Vec<PassReport> {
        let names: Vec<String> = self.held.iter().map(|entry| entry.key().clone()).collect();
        let mut batch = ChangeBatch::new();
        for name in names {
            if let Some((name, held)) = self.held.remove(&name) {
                batch.inject(name, held.value);
            }
        }
        self.release(batch)
    }

    /// Number of controls with a value waiting to settle.
    pub fn held_controls(&self) -> usize {
        self.held.len()
    }

    fn release(&self, batch: ChangeBatch) -> Vec<PassReport> {
        if batch.is_empty() {
            return Vec::new();
        }
        match self.engine.submit(batch) {
            Ok(reports) => reports,
            Err(error) => {
                warn!(%error, "settled control batch rejected");
                Vec::new()
            }
        }
    }

    /// Periodically release settled controls on the tokio runtime.
    ///
    /// Passes run on the blocking pool. The loop runs until the returned
    /// handle is aborted. Must be called from within a tokio runtime.
    pub fn spawn_settle_loop(&self) -> JoinHandle<()> {
        let bridge = self.clone();
        let period = (self.debounce / 2).max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if bridge.held.is_empty() {
                    continue;
                }
                let worker = bridge.clone();
                match tokio::task::spawn_blocking(move || worker.flush_settled(Instant::now())).await {
                    Ok(reports) if !reports.is_empty() => {
                        debug!(passes = reports.len(), "settled controls released");
                    }
                    Ok(_) => {}
                    Err(error) => warn!(%error, "settle flush failed"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::error::CellError;
    use crate::graph::{Cell, GraphBuilder, Outputs};
    use crate::reactive::{CellInputs, RecordingSink};
    use parking_lot::Mutex;
    use serde_json::json;

    fn bridge(debounce_ms: u64) -> (EventBridge, Arc<Mutex<Vec<f64>>>) {
        let observed = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&observed);
        let mut builder = GraphBuilder::new();
        builder
            .register(Cell::new("filter", ["min_bill"], ["filtered"], move |inputs: &CellInputs| {
                let t: f64 = inputs.decode("min_bill")?;
                if t < 0.0 {
                    return Err(CellError::failed("negative threshold"));
                }
                seen.lock().push(t);
                Ok(Outputs::new().with("filtered", json!(t)))
            }))
            .unwrap();
        let config = EngineConfig {
            debounce_ms,
            ..EngineConfig::default()
        };
        let engine = Engine::with_config(builder, RecordingSink::new(), config).unwrap();
        (EventBridge::new(engine), observed)
    }

    #[test]
    fn zero_debounce_forwards_immediately() {
        let (bridge, observed) = bridge(0);
        let reports = bridge.on_control_changed("min_bill", json!(10.0)).unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].dirty, vec!["min_bill"]);
        assert_eq!(*observed.lock(), vec![10.0]);
        assert_eq!(bridge.held_controls(), 0);
    }

    #[test]
    fn produced_variable_is_not_a_control() {
        let (bridge, _) = bridge(0);
        assert!(matches!(
            bridge.on_control_changed("filtered", json!(1)).unwrap_err(),
            GraphError::NotInjectable { .. }
        ));
    }

    #[test]
    fn held_events_release_latest_value_once_settled() {
        let (bridge, observed) = bridge(100);
        for v in [5.0, 7.5, 12.0] {
            assert!(bridge.on_control_changed("min_bill", json!(v)).unwrap().is_empty());
        }
        assert_eq!(bridge.held_controls(), 1);

        assert!(bridge.flush_settled(Instant::now()).is_empty());
        assert_eq!(bridge.held_controls(), 1);

        let reports = bridge.flush_settled(Instant::now() + Duration::from_secs(1));
        assert_eq!(reports.len(), 1);
        assert_eq!(*observed.lock(), vec![12.0]);
        assert_eq!(bridge.held_controls(), 0);
    }

    #[test]
    fn flush_all_ignores_age() {
        let (bridge, observed) = bridge(60_000);
        bridge.on_control_changed("min_bill", json!(3.0)).unwrap();
        assert_eq!(bridge.flush_all().len(), 1);
        assert_eq!(*observed.lock(), vec![3.0]);
        assert!(bridge.flush_all().is_empty());
    }

    #[test]
    fn identical_settled_value_runs_nothing() {
        let (bridge, observed) = bridge(0);
        bridge.on_control_changed("min_bill", json!(8.0)).unwrap();
        assert!(bridge.on_control_changed("min_bill", json!(8.0)).unwrap().is_empty());
        assert_eq!(observed.lock().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn settle_loop_recomputes_on_settle() {
        let (bridge, observed) = bridge(20);
        let task = bridge.spawn_settle_loop();

        for v in [1.0, 2.0, 3.0, 4.0, 5.0] {
            bridge.on_control_changed("min_bill", json!(v)).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        task.abort();

        assert_eq!(*observed.lock(), vec![5.0]);
        assert_eq!(bridge.engine().passes_run().unwrap(), 1);
    }
}
