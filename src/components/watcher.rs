use crate::{components::prober::Prober, store::Store, types::StateRow};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, Mutex},
    time::{interval, sleep, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

const WARM_UP_DELAY: Duration = Duration::from_secs(10);

/// Drives the probe sweeps: on every tick it runs maintenance, enumerates
/// all states and hands them to a bounded worker pool.
pub struct Watcher {
    store: Store,
    prober: Prober,
    max_threads: usize,
    delay: Duration,
    warm_up: Duration,
}

impl Watcher {
    pub fn new(store: Store, prober: Prober, max_threads: usize, delay: Duration) -> Self {
        Self {
            store,
            prober,
            max_threads: max_threads.max(1),
            delay,
            warm_up: WARM_UP_DELAY,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        // Give discovery a head start at boot before the first sweep
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(self.warm_up) => {}
        }
        info!("Start watching TLS endpoints");

        // The channel stays tiny on purpose: with busy workers the sweep
        // blocks on send, which bounds concurrent probes to the pool size.
        let (jobs, job_source) = mpsc::channel::<StateRow>(1);
        let job_source = Arc::new(Mutex::new(job_source));
        for _ in 0..self.max_threads {
            tokio::spawn(Self::worker(
                self.store.clone(),
                self.prober.clone(),
                job_source.clone(),
                cancel.clone(),
            ));
        }

        let mut ticker = interval(self.delay);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            self.maintain().await;

            for state in self.store.get_states().await {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    sent = jobs.send(state) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Stop watching TLS endpoints");
                    return;
                }
                _ = ticker.tick() => {}
            }
        }
    }

    /// Reaps rows discovery stopped asserting, then certificates nothing
    /// links to anymore.
    async fn maintain(&self) {
        if let Err(e) = self.store.prune_stale_discovered().await {
            error!("Failed to prune stale discovered states: {}", e);
        }
        if let Err(e) = self.store.prune_orphan_certs().await {
            error!("Failed to prune orphan certificates: {}", e);
        }
    }

    async fn worker(
        store: Store,
        prober: Prober,
        jobs: Arc<Mutex<mpsc::Receiver<StateRow>>>,
        cancel: CancellationToken,
    ) {
        loop {
            let mut state = {
                let mut jobs = jobs.lock().await;
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    state = jobs.recv() => match state {
                        Some(state) => state,
                        None => return,
                    }
                }
            };

            prober.update_state(&mut state).await;
            if let Err(e) = store.update_state(&state).await {
                error!("Failed to persist state of {}: {}", state.host, e);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::{StateKind, Validity};
    use rcgen::{date_time_ymd, CertificateParams, KeyPair};
    use rustls_pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
    use std::net::SocketAddr;
    use tokio::{io::AsyncReadExt, net::TcpListener};
    use tokio_rustls::{rustls::ServerConfig, TlsAcceptor};

    async fn open_store() -> Store {
        let (store, writer) = Store::open_in_memory().await.unwrap();
        tokio::spawn(writer.run(CancellationToken::new()));
        store
    }

    async fn serve_tls(sni: &str) -> SocketAddr {
        let mut params = CertificateParams::new(vec![sni.to_owned()]).unwrap();
        params.not_before = date_time_ymd(2020, 1, 1);
        params.not_after = date_time_ymd(2099, 1, 1);
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der()));

        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert.der().clone()], key_der)
            .unwrap();
        let acceptor = TlsAcceptor::from(Arc::new(config));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    if let Ok(mut tls) = acceptor.accept(stream).await {
                        let _ = tls.read(&mut [0u8; 1]).await;
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn sweep_probes_and_persists_states() {
        let store = open_store().await;
        let addr = serve_tls("example.test").await;
        store
            .insert_state(&StateRow::new(addr.to_string(), "example.test"))
            .await
            .unwrap();
        store
            .insert_state(&StateRow::new("127.0.0.1:1", "dead.test"))
            .await
            .unwrap();

        let watcher = Watcher {
            store: store.clone(),
            prober: Prober::new(Duration::from_secs(2)),
            max_threads: 1,
            delay: Duration::from_secs(3600),
            warm_up: Duration::ZERO,
        };
        let cancel = CancellationToken::new();
        tokio::spawn(watcher.run(cancel.clone()));

        // Wait for the single sweep to settle both states
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let states = store.get_states().await;
            let done = states.iter().all(|s| s.ts.is_some());
            if done && !states.is_empty() {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "sweep never finished");
            sleep(Duration::from_millis(100)).await;
        }
        cancel.cancel();

        let states = store.get_states_with_certs().await;
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].validity, Validity::Valid);
        assert_eq!(states[0].certificates.len(), 1);

        let dead = store
            .get_states()
            .await
            .into_iter()
            .find(|s| s.host == "127.0.0.1:1")
            .unwrap();
        assert_eq!(dead.validity, Validity::Unknown);
        assert_eq!(dead.kind, StateKind::Custom);
    }
}
