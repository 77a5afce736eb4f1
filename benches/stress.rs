use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ulid::Ulid;

use rollcall::engine::Engine;
use rollcall::model::{BookingStatus, Ms, PackageBalance, PaymentMethod};
use rollcall::notify::NotifyHub;

const HOUR: Ms = 3_600_000; // one hour

fn bench_dir() -> PathBuf {
    let dir = std::env::var("ROLLCALL_BENCH_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir().join(format!("rollcall_bench_{}", Ulid::new())));
    std::fs::create_dir_all(&dir).expect("create bench dir");
    dir
}

fn new_engine(dir: &Path, name: &str) -> Arc<Engine> {
    let notify = Arc::new(NotifyHub::new());
    Arc::new(Engine::new(dir.join(name), notify).expect("open engine"))
}

fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

/// Nearest-rank quantile over an already-sorted sample; `q` in `[0, 1]`.
fn quantile(sorted: &[Duration], q: f64) -> Duration {
    match sorted.len() {
        0 => Duration::ZERO,
        n => sorted[(((n - 1) as f64) * q).round() as usize],
    }
}

fn report_latency(label: &str, latencies: &mut [Duration]) {
    latencies.sort_unstable();
    let n = latencies.len();
    let mean_ms = latencies.iter().map(Duration::as_secs_f64).sum::<f64>() * 1000.0 / n as f64;
    let ms = |q| quantile(latencies, q).as_secs_f64() * 1000.0;
    println!("  {label}:");
    println!(
        "    n={n}, mean={mean_ms:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        ms(0.50),
        ms(0.95),
        ms(0.99),
        ms(1.0),
    );
}

async fn phase1_single_studio(dir: &Path) {
    let engine = new_engine(dir, "phase1.wal");

    let class_id = Ulid::new();
    engine
        .register_class(class_id, now_ms() + 24 * HOUR, 10_000)
        .await
        .unwrap();

    // Members and their punch cards, registered outside the timed loop
    let n = 2000;
    let expires = now_ms() + 365 * 24 * HOUR;
    let mut members = Vec::with_capacity(n);
    for _ in 0..n {
        let user = Ulid::new();
        let package_id = Ulid::new();
        engine
            .register_package(
                package_id,
                user,
                PackageBalance::Metered { remaining: 10, total: 10 },
                expires,
            )
            .await
            .unwrap();
        members.push((user, package_id));
    }

    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for (user, package_id) in members {
        let t = Instant::now();
        engine
            .create_booking(class_id, user, PaymentMethod::Credits { package_id })
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s ({ops:.0} ops/sec)", elapsed.as_secs_f64());
    report_latency("booking latency", &mut latencies);
}

async fn phase2_studio_fanout(dir: &Path) {
    let n_tasks = 8;
    let n_per_task = 250;

    let start = Instant::now();
    let mut handles = Vec::new();

    for i in 0..n_tasks {
        // Each task books against its own studio engine
        let engine = new_engine(dir, &format!("phase2_{i}.wal"));

        handles.push(tokio::spawn(async move {
            let class_id = Ulid::new();
            engine
                .register_class(class_id, now_ms() + 24 * HOUR, 10_000)
                .await
                .unwrap();
            for _ in 0..n_per_task {
                engine
                    .create_booking(class_id, Ulid::new(), PaymentMethod::Cash)
                    .await
                    .unwrap();
            }
        }));
    }

    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {total} bookings across {n_tasks} studios in {:.2}s ({ops:.0} ops/sec)",
        elapsed.as_secs_f64()
    );
}

async fn phase3_hot_class_reads(dir: &Path) {
    let engine = new_engine(dir, "phase3.wal");

    // Hot class: 50 seats taken, 150 queued
    let hot_class = Ulid::new();
    engine
        .register_class(hot_class, now_ms() + 24 * HOUR, 50)
        .await
        .unwrap();
    let mut queued_ids = Vec::new();
    for i in 0..200 {
        let r = engine
            .create_booking(hot_class, Ulid::new(), PaymentMethod::Cash)
            .await
            .unwrap();
        if i < 50 {
            engine.confirm_payment(r.booking_id).await.unwrap();
        } else {
            queued_ids.push(r.booking_id);
        }
    }

    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();

    // Two writers churn the hot class's waitlist tail
    for _ in 0..2 {
        let engine = engine.clone();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            while !stop.load(Ordering::Relaxed) {
                let user = Ulid::new();
                let r = engine
                    .create_booking(hot_class, user, PaymentMethod::Cash)
                    .await
                    .unwrap();
                engine.cancel_booking(r.booking_id, user).await.unwrap();
            }
        }));
    }
    // Three more write to their own classes on the same engine
    for w in 0..3 {
        let engine = engine.clone();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let class_id = Ulid::new();
            engine
                .register_class(class_id, now_ms() + (25 + w) * HOUR, 10_000)
                .await
                .unwrap();
            while !stop.load(Ordering::Relaxed) {
                engine
                    .create_booking(class_id, Ulid::new(), PaymentMethod::Cash)
                    .await
                    .unwrap();
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 400;
    let mut reader_handles = Vec::new();

    for r in 0..n_readers {
        let engine = engine.clone();
        let probe = queued_ids[r * queued_ids.len() / n_readers];
        reader_handles.push(tokio::spawn(async move {
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                let cap = engine.get_capacity(hot_class).await.unwrap();
                assert_eq!(cap.confirmed, 50);
                let pos = engine.get_waitlist_position(probe).await.unwrap();
                assert!(pos.is_some());
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

    report_latency("capacity + position query", &mut all_latencies);
}

async fn phase4_promotion_churn(dir: &Path) {
    let engine = new_engine(dir, "phase4.wal");

    let n_classes = 20;
    let queue_depth = 10;

    // One seat per class, ten people waiting on it
    let mut classes = Vec::with_capacity(n_classes);
    for i in 0..n_classes {
        let class_id = Ulid::new();
        engine
            .register_class(class_id, now_ms() + (24 + i as i64) * HOUR, 1)
            .await
            .unwrap();
        let holder = engine
            .create_booking(class_id, Ulid::new(), PaymentMethod::Cash)
            .await
            .unwrap();
        engine.confirm_payment(holder.booking_id).await.unwrap();
        for _ in 0..queue_depth {
            engine
                .create_booking(class_id, Ulid::new(), PaymentMethod::Cash)
                .await
                .unwrap();
        }
        classes.push(class_id);
    }

    let start = Instant::now();
    let mut handles = Vec::new();

    for class_id in classes {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let mut latencies = Vec::with_capacity(queue_depth);
            // Knock out the seat holder until the queue drains
            for _ in 0..queue_depth {
                let roster = engine.bookings_for_class(class_id).await;
                let seated = roster
                    .iter()
                    .find(|b| b.status == BookingStatus::Confirmed)
                    .expect("a seat holder");
                let t = Instant::now();
                engine.cancel_booking(seated.id, seated.user_id).await.unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in handles {
        all_latencies.extend(h.await.unwrap());
    }

    let elapsed = start.elapsed();
    let total = n_classes * queue_depth;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {total} cancel+promote pairs over {n_classes} classes in {:.2}s ({ops:.0} ops/sec)",
        elapsed.as_secs_f64()
    );
    report_latency("cancel + promote latency", &mut all_latencies);
}

#[tokio::main]
async fn main() {
    let dir = bench_dir();

    println!("=== rollcall stress benchmark ===");
    println!("data dir: {}\n", dir.display());

    println!("[phase 1] one studio, sequential bookings");
    phase1_single_studio(&dir).await;

    println!("\n[phase 2] eight studios booking in parallel");
    phase2_studio_fanout(&dir).await;

    println!("\n[phase 3] roster reads against a hot class");
    phase3_hot_class_reads(&dir).await;

    println!("\n[phase 4] cancellation and promotion churn");
    phase4_promotion_churn(&dir).await;

    println!("\n=== rollcall bench complete ===");
}
