//! Integration tests for the online learning pipeline
//!
//! Drives the public API end to end: one ordered channel in, session controller ticks,
//! managers training in the background, session files out.

#[cfg(test)]
mod session_scenarios {
    use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
    use std::sync::{Arc, Condvar, Mutex};
    use std::time::Duration;
    use ndarray::Array2;
    use tactile_learn::pipeline::{
        ChannelActuationSink, Ensemble, FitSummary, JsonSnapshotSink, ManagerSettings, ModelManager,
        PipelineError, PipelineResult, Regressor, Sample, SampleSink, SessionController, SessionEvent,
        SessionSettings, SessionState, Topology, TransportMessage,
    };
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    /// Regressor whose fit waits for a gate and records how often it ran
    #[derive(Clone)]
    struct ScriptedRegressor {
        params: Vec<f64>,
        n_inputs: usize,
        n_outputs: usize,
        fit_value: f64,
        fits: Arc<AtomicUsize>,
        gate: Arc<(Mutex<bool>, Condvar)>,
    }

    impl ScriptedRegressor {
        fn new(n_inputs: usize, n_outputs: usize, fit_value: f64) -> Self {
            Self {
                params: vec![0.0; n_outputs],
                n_inputs,
                n_outputs,
                fit_value,
                fits: Arc::new(AtomicUsize::new(0)),
                gate: Arc::new((Mutex::new(true), Condvar::new())),
            }
        }

        fn closed(mut self) -> Self {
            self.gate = Arc::new((Mutex::new(false), Condvar::new()));
            self
        }

        fn open(&self) {
            let (lock, cvar) = &*self.gate;
            *lock.lock().unwrap() = true;
            cvar.notify_all();
        }
    }

    impl Regressor for ScriptedRegressor {
        fn fit(&mut self, _x: &Array2<f64>, y: &Array2<f64>) -> PipelineResult<FitSummary> {
            let (lock, cvar) = &*self.gate;
            let mut open = lock.lock().unwrap();
            while !*open {
                open = cvar.wait(open).unwrap();
            }
            if y.ncols() != self.n_outputs {
                return Err(PipelineError::Training("target arity".to_string()));
            }
            self.fits.fetch_add(1, Ordering::SeqCst);
            self.params.iter_mut().for_each(|p| *p = self.fit_value);
            Ok(FitSummary {
                epochs: 1,
                final_loss: 0.0,
            })
        }

        fn predict(&self, x: &Array2<f64>) -> PipelineResult<Array2<f64>> {
            Ok(Array2::from_shape_fn((x.nrows(), self.n_outputs), |(_, c)| self.params[c]))
        }

        fn parameters(&self) -> Vec<f64> {
            self.params.clone()
        }

        fn load_parameters(&mut self, params: &[f64]) -> PipelineResult<()> {
            if params.len() != self.params.len() {
                return Err(PipelineError::Configuration("length".to_string()));
            }
            self.params.copy_from_slice(params);
            Ok(())
        }

        fn n_inputs(&self) -> usize {
            self.n_inputs
        }

        fn n_outputs(&self) -> usize {
            self.n_outputs
        }
    }

    struct Rig {
        controller: SessionController<ScriptedRegressor>,
        inbound_tx: mpsc::Sender<TransportMessage>,
        clock: Arc<AtomicI64>,
    }

    impl Rig {
        async fn send(&self, event: SessionEvent) {
            self.inbound_tx.send(event.into()).await.unwrap();
        }
    }

    fn rig(model: ScriptedRegressor, target_arity: usize, required_samples: usize, max_samples: usize) -> Rig {
        let settings = SessionSettings {
            feature_arity: 4,
            target_arity,
            required_samples,
            max_samples,
            learning_time: Duration::from_secs(60),
            feature_scale: 100.0,
        };
        let ensemble = Ensemble::build(
            Topology::Joint,
            4,
            target_arity,
            ManagerSettings::default(),
            |_| Ok(model.clone()),
        )
        .unwrap();

        let (inbound_tx, inbound_rx) = mpsc::channel(10_000);
        let clock = Arc::new(AtomicI64::new(1_700_000_000_000));
        let clock_fn = Arc::clone(&clock);
        let controller = SessionController::new(settings, ensemble, inbound_rx)
            .unwrap()
            .with_now_fn(Box::new(move || clock_fn.load(Ordering::SeqCst)));

        Rig {
            controller,
            inbound_tx,
            clock,
        }
    }

    fn sample(i: usize, target_arity: usize) -> Sample {
        let f = i as f64;
        Sample::new(
            1_700_000_000_000 + i as i64,
            vec![f, f + 1.0, f + 2.0, f + 3.0],
            vec![f * 0.01; target_arity],
        )
    }

    async fn feed(rig: &Rig, range: std::ops::Range<usize>, target_arity: usize) {
        for i in range {
            rig.inbound_tx.send(sample(i, target_arity).into()).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_first_window_dispatch() {
        // 50 samples, arity 4 -> 1, required 40, max 1000
        let model = ScriptedRegressor::new(4, 1, 1.0);
        let fits = Arc::clone(&model.fits);
        let mut rig = rig(model, 1, 40, 1000);

        rig.send(SessionEvent::Connected).await;
        feed(&rig, 0..50, 1).await;

        let report = rig.controller.tick().await;
        assert_eq!(report.drained, 50);
        assert_eq!(report.dispatched, Some(0..50));
        assert_eq!(rig.controller.cursors(), (50, 50));

        rig.controller.shutdown().await;
        assert_eq!(fits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disconnect_waits_for_running_job() {
        let model = ScriptedRegressor::new(4, 3, 1.0).closed();
        let gate = model.clone();
        let fits = Arc::clone(&model.fits);
        let mut rig = rig(model, 3, 10, 1000);

        rig.send(SessionEvent::Connected).await;
        feed(&rig, 0..20, 3).await;
        rig.controller.tick().await;
        assert!(rig.controller.ensemble().is_training());

        rig.send(SessionEvent::Disconnected).await;
        let opener = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            gate.open();
        });
        rig.controller.tick().await;
        opener.join().unwrap();

        // the disconnect tick only returned after the job finished
        assert_eq!(fits.load(Ordering::SeqCst), 1);
        assert!(!rig.controller.ensemble().is_training());
        assert_eq!(rig.controller.state(), SessionState::Idle);

        rig.send(SessionEvent::Connected).await;
        rig.controller.tick().await;
        assert_eq!(rig.controller.state(), SessionState::Learning);
        assert_eq!(rig.controller.store().len(), 0);
        assert_eq!(rig.controller.cursors(), (0, 0));
    }

    #[tokio::test]
    async fn test_freeze_happens_once_and_blocks_training() {
        let model = ScriptedRegressor::new(4, 3, 2.0);
        let fits = Arc::clone(&model.fits);
        let mut rig = rig(model, 3, 10, 1000);
        let (act_tx, mut act_rx) = mpsc::channel(64);
        rig.controller = rig
            .controller
            .with_actuation(Box::new(ChannelActuationSink::new(act_tx)));
        let start = rig.clock.load(Ordering::SeqCst);

        rig.send(SessionEvent::Connected).await;
        feed(&rig, 0..5, 3).await;
        rig.controller.tick().await;

        rig.clock.store(start + 61_000, Ordering::SeqCst);
        let mut freezes = 0;
        for round in 0..5 {
            feed(&rig, 5 + round * 20..25 + round * 20, 3).await;
            let report = rig.controller.tick().await;
            if report.froze {
                freezes += 1;
            }
            assert_eq!(report.dispatched, None);
            assert!(report.actuated);
        }

        assert_eq!(freezes, 1);
        assert_eq!(rig.controller.state(), SessionState::Frozen);
        assert_eq!(fits.load(Ordering::SeqCst), 0);
        assert_eq!(rig.controller.ensemble().stats()[0].started, 0);
        // untrained live model predicts zeros
        assert_eq!(act_rx.recv().await, Some(vec![0.0, 0.0, 0.0]));
    }

    #[tokio::test]
    async fn test_busy_manager_drops_second_start() {
        let model = ScriptedRegressor::new(4, 1, 1.0).closed();
        let gate = model.clone();
        let fits = Arc::clone(&model.fits);
        let manager = ModelManager::new("scenario_d", model, 4, 1, ManagerSettings::default()).unwrap();

        let x = Array2::zeros((8, 4));
        let y = Array2::zeros((8, 1));
        assert!(manager.start(x.clone(), y.clone()));
        assert!(!manager.start(x, y));

        gate.open();
        manager.close().await;

        assert_eq!(fits.load(Ordering::SeqCst), 1);
        assert_eq!(manager.stats().merged, 1);
        let live = manager.live_parameters();
        assert!((live[0] - 0.95).abs() < 1e-12);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_predictions_never_see_partial_merge() {
        let model = ScriptedRegressor::new(4, 256, 1.0);
        let manager = Arc::new(ModelManager::new("torn", model, 4, 256, ManagerSettings::default()).unwrap());
        let x = Array2::zeros((1, 4));

        for _ in 0..20 {
            manager.start(Array2::zeros((4, 4)), Array2::zeros((4, 256)));
            for _ in 0..50 {
                let pred = manager.predict(&x).unwrap();
                let first = pred[[0, 0]];
                assert!(pred.row(0).iter().all(|v| *v == first));
            }
            manager.close().await;
        }
        assert_eq!(manager.stats().merged, 20);
    }

    #[tokio::test]
    async fn test_window_skipped_while_busy_is_not_retried() {
        let model = ScriptedRegressor::new(4, 1, 1.0).closed();
        let gate = model.clone();
        let mut rig = rig(model, 1, 10, 1000);

        rig.send(SessionEvent::Connected).await;
        feed(&rig, 0..10, 1).await;
        let first = rig.controller.tick().await;
        assert_eq!(first.accepted, 1);

        feed(&rig, 10..20, 1).await;
        let second = rig.controller.tick().await;
        assert_eq!(second.dispatched, Some(10..20));
        assert_eq!(second.accepted, 0);
        assert_eq!(rig.controller.cursors(), (20, 20));

        gate.open();
        rig.controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_training_window_is_capped() {
        let model = ScriptedRegressor::new(4, 1, 1.0);
        let mut rig = rig(model, 1, 10, 25);

        rig.send(SessionEvent::Connected).await;
        feed(&rig, 0..100, 1).await;
        let report = rig.controller.tick().await;
        assert_eq!(report.dispatched, Some(75..100));
        assert_eq!(rig.controller.cursors(), (100, 100));
        rig.controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_session_is_persisted_on_disconnect() {
        let dir = TempDir::new().unwrap();
        let model = ScriptedRegressor::new(4, 1, 1.0);
        let mut rig = rig(model, 1, 1000, 1000);
        rig.controller = rig
            .controller
            .with_sink(Box::new(JsonSnapshotSink::new(dir.path()).unwrap()));

        rig.send(SessionEvent::Connected).await;
        feed(&rig, 0..30, 1).await;
        rig.controller.tick().await;
        feed(&rig, 30..42, 1).await;
        rig.send(SessionEvent::Disconnected).await;
        rig.controller.tick().await;

        let mut reader = JsonSnapshotSink::new(dir.path()).unwrap();
        let saved = reader.load().await.unwrap();
        assert_eq!(saved.len(), 42);
        for (i, s) in saved.iter().enumerate() {
            assert_eq!(s.timestamp_ms, 1_700_000_000_000 + i as i64);
        }
        // the tail arriving with the disconnect is predicted before saving
        assert!(saved.iter().all(|s| s.prediction == Some(vec![0.0])));
    }

    #[tokio::test]
    async fn test_interleaved_sessions_in_one_tick() {
        let dir = TempDir::new().unwrap();
        let model = ScriptedRegressor::new(4, 1, 1.0);
        let mut rig = rig(model, 1, 1000, 1000);
        rig.controller = rig
            .controller
            .with_sink(Box::new(JsonSnapshotSink::new(dir.path()).unwrap()));

        // everything queued before the controller looks at the channel
        rig.send(SessionEvent::Connected).await;
        feed(&rig, 0..50, 1).await;
        rig.send(SessionEvent::Disconnected).await;
        rig.send(SessionEvent::Connected).await;
        feed(&rig, 50..60, 1).await;
        rig.controller.tick().await;

        assert_eq!(rig.controller.sessions_started(), 2);
        assert_eq!(rig.controller.state(), SessionState::Learning);
        assert_eq!(rig.controller.store().len(), 10);
        assert_eq!(
            rig.controller.store().get(0).map(|s| s.timestamp_ms),
            Some(1_700_000_000_050)
        );

        let saved = JsonSnapshotSink::new(dir.path()).unwrap().load().await.unwrap();
        assert_eq!(saved.len(), 50);
        assert_eq!(saved[49].timestamp_ms, 1_700_000_000_049);

        rig.send(SessionEvent::Disconnected).await;
        rig.controller.tick().await;
        assert_eq!(rig.controller.state(), SessionState::Idle);
    }
}
