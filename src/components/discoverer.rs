use crate::{configs::ZoneConfig, store::Store, types::StateRow};
use anyhow::{bail, Context, Result as AnyResult};
use futures::{stream::FuturesUnordered, StreamExt};
use hickory_proto::{
    op::{Message, MessageType, OpCode, Query, ResponseCode},
    rr::{DNSClass, Name, RData, Record, RecordType},
};
use std::{
    sync::atomic::{AtomicU16, Ordering},
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::{interval, timeout, timeout_at, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

static TRANSFER_ID: AtomicU16 = AtomicU16::new(0);

const MAX_TRANSFER_MESSAGES: usize = 4096;

/// Periodically transfers the configured zones and projects their A and MX
/// records into discovered state rows.
pub struct Discoverer {
    store: Store,
    zones: Vec<ZoneConfig>,
    delay: Duration,
    timeout: Duration,
}

impl Discoverer {
    pub fn new(store: Store, zones: Vec<ZoneConfig>, delay: Duration, timeout: Duration) -> Self {
        Self {
            store,
            zones,
            delay,
            timeout,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!("Start discovering DNS zones");
        let mut ticker = interval(self.delay);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            self.discover_zones().await;
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Stop discovering DNS zones");
                    return;
                }
                _ = ticker.tick() => {}
            }
        }
    }

    /// One discovery pass. Zones transfer concurrently; a failing zone is
    /// logged and skipped until the next tick.
    pub(crate) async fn discover_zones(&self) {
        let mut transfers: FuturesUnordered<_> = self
            .zones
            .iter()
            .map(|zone| async move { (zone, self.transfer_zone(zone).await) })
            .collect();

        while let Some((zone, result)) = transfers.next().await {
            let records = match result {
                Ok(records) => {
                    info!(
                        "Transferred zone {} from {} ({} records)",
                        zone.name,
                        zone.master,
                        records.len()
                    );
                    records
                }
                Err(e) => {
                    error!(
                        "Transfer of zone {} from {} failed: {}",
                        zone.name, zone.master, e
                    );
                    continue;
                }
            };

            for state in project_records(zone, &records) {
                if let Err(e) = self.store.insert_state(&state).await {
                    error!("Failed to record discovered host {}: {}", state.host, e);
                }
            }
        }
    }

    /// AXFR over TCP with 2-byte length framing, reading response messages
    /// until the closing SOA. The whole answer stream shares one deadline
    /// and a message cap, so a response that never terminates the transfer
    /// fails once instead of stalling every read.
    async fn transfer_zone(&self, zone: &ZoneConfig) -> AnyResult<Vec<Record>> {
        let name = Name::from_utf8(&zone.name)?;
        let mut query = Query::query(name, RecordType::AXFR);
        query.set_query_class(DNSClass::IN);

        let mut request = Message::new();
        request
            .set_id(TRANSFER_ID.fetch_add(1, Ordering::Relaxed))
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(false)
            .add_query(query);
        let wire = request.to_vec()?;

        let mut stream = timeout(self.timeout, TcpStream::connect(&zone.master))
            .await
            .with_context(|| format!("connecting to {} timed out", zone.master))??;
        stream.write_all(&(wire.len() as u16).to_be_bytes()).await?;
        stream.write_all(&wire).await?;

        let deadline = Instant::now() + self.timeout;
        let mut records = Vec::new();
        let mut soa_seen = 0;
        let mut messages = 0;
        while soa_seen < 2 {
            if messages == MAX_TRANSFER_MESSAGES {
                bail!(
                    "no terminating SOA from {} after {} messages",
                    zone.master,
                    MAX_TRANSFER_MESSAGES
                );
            }
            let mut len_buf = [0u8; 2];
            timeout_at(deadline, stream.read_exact(&mut len_buf))
                .await
                .with_context(|| {
                    format!("transfer from {} did not complete in time", zone.master)
                })??;
            let mut buf = vec![0u8; u16::from_be_bytes(len_buf) as usize];
            timeout_at(deadline, stream.read_exact(&mut buf))
                .await
                .with_context(|| {
                    format!("transfer from {} did not complete in time", zone.master)
                })??;
            messages += 1;

            let response = Message::from_vec(&buf)?;
            if response.response_code() != ResponseCode::NoError {
                bail!("server answered {}", response.response_code());
            }
            if response.answers().is_empty() {
                bail!("server closed the transfer without a terminating SOA");
            }
            for record in response.answers() {
                if record.record_type() == RecordType::SOA {
                    soa_seen += 1;
                }
                records.push(record.clone());
            }
        }
        Ok(records)
    }
}

/// A records point at the name itself on port 443; MX records point at the
/// mail exchange on the zone's `portMX`. Trailing root dots are stripped and
/// excluded names are skipped.
fn project_records(zone: &ZoneConfig, records: &[Record]) -> Vec<StateRow> {
    let mut states = Vec::new();
    for record in records {
        match record.data() {
            Some(RData::A(_)) => {
                let name = trim_fqdn(&record.name().to_utf8());
                if is_excluded(zone, &name) {
                    continue;
                }
                let host = format!("{name}:443");
                states.push(StateRow::discovered(host, name));
            }
            Some(RData::MX(mx)) if !zone.omit_mx => {
                let name = trim_fqdn(&mx.exchange().to_utf8());
                if is_excluded(zone, &name) {
                    continue;
                }
                let host = format!("{}:{}", name, zone.port_mx);
                states.push(StateRow::discovered(host, name));
            }
            _ => {}
        }
    }
    states
}

fn trim_fqdn(name: &str) -> String {
    name.strip_suffix('.').unwrap_or(name).to_owned()
}

fn is_excluded(zone: &ZoneConfig, name: &str) -> bool {
    zone.excludes
        .iter()
        .any(|excluded| excluded.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::StateKind;
    use chrono::Utc;
    use hickory_proto::rr::rdata::{MX, SOA};
    use std::net::{Ipv4Addr, SocketAddr};
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    async fn open_store() -> Store {
        let (store, writer) = Store::open_in_memory().await.unwrap();
        tokio::spawn(writer.run(CancellationToken::new()));
        store
    }

    fn a_record(name: &str) -> Record {
        Record::from_rdata(
            Name::from_utf8(name).unwrap(),
            3600,
            RData::A(Ipv4Addr::new(10, 0, 0, 1).into()),
        )
    }

    fn mx_record(zone: &str, exchange: &str) -> Record {
        Record::from_rdata(
            Name::from_utf8(zone).unwrap(),
            3600,
            RData::MX(MX::new(10, Name::from_utf8(exchange).unwrap())),
        )
    }

    /// Serves a single AXFR answer: SOA, the given records, closing SOA.
    async fn mock_axfr_server(zone: &str, records: Vec<Record>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let apex = Name::from_utf8(zone).unwrap();

        tokio::spawn(async move {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let mut len_buf = [0u8; 2];
            stream.read_exact(&mut len_buf).await.unwrap();
            let mut buf = vec![0u8; u16::from_be_bytes(len_buf) as usize];
            stream.read_exact(&mut buf).await.unwrap();
            let request = Message::from_vec(&buf).unwrap();

            let soa = Record::from_rdata(
                apex.clone(),
                3600,
                RData::SOA(SOA::new(apex.clone(), apex.clone(), 1, 3600, 900, 86400, 300)),
            );
            let mut answers = vec![soa.clone()];
            answers.extend(records);
            answers.push(soa);

            let mut response = Message::new();
            response
                .set_id(request.id())
                .set_message_type(MessageType::Response)
                .set_op_code(OpCode::Query)
                .add_answers(answers);
            if let Some(query) = request.queries().first() {
                response.add_query(query.clone());
            }

            let wire = response.to_vec().unwrap();
            stream
                .write_all(&(wire.len() as u16).to_be_bytes())
                .await
                .unwrap();
            stream.write_all(&wire).await.unwrap();
        });
        addr
    }

    fn zone(master: SocketAddr) -> ZoneConfig {
        ZoneConfig {
            master: master.to_string(),
            name: "corp.example.".to_owned(),
            proto: "tcp".to_owned(),
            omit_mx: false,
            port_mx: 25,
            excludes: Vec::new(),
        }
    }

    fn discoverer(store: Store, zones: Vec<ZoneConfig>) -> Discoverer {
        Discoverer::new(
            store,
            zones,
            Duration::from_secs(3600),
            Duration::from_secs(2),
        )
    }

    #[tokio::test]
    async fn a_and_mx_records_become_discovered_states() {
        let records = vec![
            a_record("a.corp.example."),
            mx_record("corp.example.", "mx.corp.example."),
        ];
        let master = mock_axfr_server("corp.example.", records).await;
        let store = open_store().await;

        discoverer(store.clone(), vec![zone(master)])
            .discover_zones()
            .await;

        let states = store.get_states().await;
        assert_eq!(states.len(), 2);

        let web = states.iter().find(|s| s.host == "a.corp.example:443").unwrap();
        assert_eq!(web.sni, "a.corp.example");
        assert_eq!(web.kind, StateKind::Discovered);
        let age = Utc::now() - web.last_discovery.unwrap();
        assert!(age < chrono::Duration::seconds(10));

        let mail = states.iter().find(|s| s.host == "mx.corp.example:25").unwrap();
        assert_eq!(mail.sni, "mx.corp.example");
        assert_eq!(mail.kind, StateKind::Discovered);
    }

    #[tokio::test]
    async fn omit_mx_skips_mail_exchanges() {
        let records = vec![
            a_record("a.corp.example."),
            mx_record("corp.example.", "mx.corp.example."),
        ];
        let master = mock_axfr_server("corp.example.", records).await;
        let store = open_store().await;

        let mut cfg = zone(master);
        cfg.omit_mx = true;
        discoverer(store.clone(), vec![cfg]).discover_zones().await;

        let states = store.get_states().await;
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].host, "a.corp.example:443");
    }

    #[tokio::test]
    async fn excluded_names_are_skipped() {
        let records = vec![a_record("a.corp.example."), a_record("skip.corp.example.")];
        let master = mock_axfr_server("corp.example.", records).await;
        let store = open_store().await;

        let mut cfg = zone(master);
        cfg.excludes = vec!["skip.corp.example".to_owned()];
        discoverer(store.clone(), vec![cfg]).discover_zones().await;

        let states = store.get_states().await;
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].host, "a.corp.example:443");
    }

    #[tokio::test]
    async fn failing_zone_does_not_block_others() {
        let master = mock_axfr_server("corp.example.", vec![a_record("a.corp.example.")]).await;
        let store = open_store().await;

        let mut dead = zone("127.0.0.1:1".parse().unwrap());
        dead.name = "dead.example.".to_owned();
        discoverer(store.clone(), vec![dead, zone(master)])
            .discover_zones()
            .await;

        let states = store.get_states().await;
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].host, "a.corp.example:443");
    }

    #[tokio::test]
    async fn truncated_transfer_fails_fast() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let apex = Name::from_utf8("corp.example.").unwrap();

        // Sends only the opening SOA and then leaves the connection open
        tokio::spawn(async move {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let mut len_buf = [0u8; 2];
            stream.read_exact(&mut len_buf).await.unwrap();
            let mut buf = vec![0u8; u16::from_be_bytes(len_buf) as usize];
            stream.read_exact(&mut buf).await.unwrap();
            let request = Message::from_vec(&buf).unwrap();

            let soa = Record::from_rdata(
                apex.clone(),
                3600,
                RData::SOA(SOA::new(apex.clone(), apex, 1, 3600, 900, 86400, 300)),
            );
            let mut response = Message::new();
            response
                .set_id(request.id())
                .set_message_type(MessageType::Response)
                .set_op_code(OpCode::Query)
                .add_answers(vec![soa]);
            let wire = response.to_vec().unwrap();
            stream
                .write_all(&(wire.len() as u16).to_be_bytes())
                .await
                .unwrap();
            stream.write_all(&wire).await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let store = open_store().await;
        let started = std::time::Instant::now();
        Discoverer::new(
            store.clone(),
            vec![zone(addr)],
            Duration::from_secs(3600),
            Duration::from_millis(500),
        )
        .discover_zones()
        .await;

        // One shared deadline for the whole stream, not one per read
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(store.get_states().await.is_empty());
    }

    #[tokio::test]
    async fn rediscovery_refreshes_existing_rows() {
        let master = mock_axfr_server("corp.example.", vec![a_record("a.corp.example.")]).await;
        let store = open_store().await;
        discoverer(store.clone(), vec![zone(master)])
            .discover_zones()
            .await;

        let first = store.get_states().await[0].last_discovery.unwrap();

        tokio::time::sleep(Duration::from_millis(1100)).await;
        let master = mock_axfr_server("corp.example.", vec![a_record("a.corp.example.")]).await;
        discoverer(store.clone(), vec![zone(master)])
            .discover_zones()
            .await;

        let states = store.get_states().await;
        assert_eq!(states.len(), 1);
        assert!(states[0].last_discovery.unwrap() > first);
    }
}
