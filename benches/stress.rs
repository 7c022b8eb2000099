use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate};
use tokio_postgres::{Config, NoTls};
use ulid::Ulid;

async fn connect(host: &str, port: u16, dbname: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname(dbname)
        .user("flexdesk")
        .password("flexdesk");

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn fresh_tenant() -> String {
    format!("bench_{}", Ulid::new())
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

/// Day `n` after an arbitrary far-future origin.
fn day(n: u64) -> String {
    let origin = NaiveDate::from_ymd_opt(2030, 1, 1).expect("valid origin");
    (origin + Days::new(n)).format("%Y-%m-%d").to_string()
}

async fn create_space(client: &tokio_postgres::Client, title: &str) -> Ulid {
    let sid = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO spaces (id, title, address, latitude, longitude, capacity, price_per_day) \
             VALUES ('{sid}', '{title}', 'Bench St', 0.0, 0.0, 10, 100)"
        ))
        .await
        .unwrap();
    sid
}

async fn create_user(client: &tokio_postgres::Client) -> Ulid {
    let uid = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO users (id, name, email) VALUES ('{uid}', 'Bench', '{uid}@bench.test')"
        ))
        .await
        .unwrap();
    uid
}

async fn book(
    client: &tokio_postgres::Client,
    sid: Ulid,
    uid: Ulid,
    day_n: u64,
) -> Result<(), tokio_postgres::Error> {
    let date = day(day_n);
    client
        .batch_execute(&format!(
            "INSERT INTO reservations (id, space_id, user_id, start_date, end_date) \
             VALUES ('{}', '{sid}', '{uid}', '{date}', '{date}')",
            Ulid::new()
        ))
        .await
}

async fn phase1_sequential(host: &str, port: u16) {
    let client = connect(host, port, &fresh_tenant()).await;
    let sid = create_space(&client, "Sequential").await;
    let uid = create_user(&client).await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n as u64 {
        let t = Instant::now();
        book(&client, sid, uid, i).await.unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

/// Every task races for the same days on one space; exactly one booking per
/// day may win.
async fn phase2_contention(host: &str, port: u16) {
    let tenant = fresh_tenant();
    let setup = connect(host, port, &tenant).await;
    let sid = create_space(&setup, "Contended").await;

    let n_tasks = 10;
    let n_days = 200;
    let won = Arc::new(AtomicUsize::new(0));
    let lost = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..n_tasks {
        let host = host.to_string();
        let tenant = tenant.clone();
        let (won, lost) = (won.clone(), lost.clone());
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &tenant).await;
            let uid = create_user(&client).await;
            for d in 0..n_days {
                match book(&client, sid, uid, d).await {
                    Ok(()) => won.fetch_add(1, Ordering::Relaxed),
                    Err(_) => lost.fetch_add(1, Ordering::Relaxed),
                };
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_days as usize;
    let won = won.load(Ordering::Relaxed);
    println!(
        "  {n_tasks} tasks x {n_days} days = {total} attempts in {:.2}s = {:.0} ops/sec",
        elapsed.as_secs_f64(),
        total as f64 / elapsed.as_secs_f64()
    );
    println!(
        "  {won} won, {} conflicted (expected {n_days} won)",
        lost.load(Ordering::Relaxed)
    );
}

async fn phase3_read_under_load(host: &str, port: u16) {
    let tenant = fresh_tenant();
    let setup = connect(host, port, &tenant).await;
    let sid = create_space(&setup, "Busy").await;
    let uid = create_user(&setup).await;
    for d in 0..200 {
        book(&setup, sid, uid, d).await.unwrap();
    }

    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..5u64 {
        let host = host.to_string();
        let tenant = tenant.clone();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &tenant).await;
            let wsid = create_space(&client, &format!("Writer {w}")).await;
            let wuid = create_user(&client).await;
            let mut d = 0;
            while !stop.load(Ordering::Relaxed) && d < 360 {
                let _ = book(&client, wsid, wuid, d).await;
                d += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();
    for r in 0..n_readers {
        let host = host.to_string();
        let tenant = tenant.clone();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &tenant).await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for i in 0..reads_per_reader {
                let from = day(((r * reads_per_reader + i) % 190) as u64);
                let to = day(((r * reads_per_reader + i) % 190 + 10) as u64);
                let sql = if i % 2 == 0 {
                    format!(
                        "SELECT * FROM conflicts WHERE space_id = '{sid}' \
                         AND start_date = '{from}' AND end_date = '{to}'"
                    )
                } else {
                    "SELECT * FROM report".to_string()
                };
                let t = Instant::now();
                client.simple_query(&sql).await.unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }
    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("conflict/report query", &mut all_latencies);
}

async fn phase4_connection_storm(host: &str, port: u16) {
    let n_conns = 50;
    let ops_per_conn = 10;

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = Arc::new(AtomicUsize::new(0));

    for _ in 0..n_conns {
        let host = host.to_string();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &fresh_tenant()).await;
            let sid = create_space(&client, "Storm").await;
            let uid = create_user(&client).await;
            for d in 0..ops_per_conn {
                book(&client, sid, uid, d).await.unwrap();
            }
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} ops each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("FLEXDESK_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("FLEXDESK_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid FLEXDESK_PORT");

    println!("=== flexdesk stress benchmark ===");
    println!("target: {host}:{port}\n");

    // Each phase uses its own tenant so the numbers don't bleed into each other.

    println!("[phase 1] sequential booking throughput");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] contended bookings on one space");
    phase2_contention(&host, port).await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load(&host, port).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port).await;

    println!("\n=== benchmark complete ===");
}
