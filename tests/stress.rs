//! Concurrent stress: balance conservation under every protocol
//!
//! A bank of accounts, several worker threads, each transaction moving one
//! unit between two random accounts through the retry driver. Whatever the
//! protocol aborts and retries, the total balance is conserved and every
//! thread finishes its quota — deadlock-freedom included.

use bedrock_core::{PerTxStat, Schema, TxError};
use bedrock_engine::{
    run_with_retry, MvtoEngine, NoWaitEngine, SiloEngine, TxSource, WaitDieEngine,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const T: u64 = 1;
const ACCOUNTS: u64 = 16;
const INITIAL: u64 = 1_000;
const THREADS: usize = 4;
const TRANSFERS: usize = 200;

fn schema() -> Arc<Schema> {
    Schema::builder().table(T, 8).freeze()
}

fn read_u64(rec: &[u8]) -> u64 {
    u64::from_le_bytes(rec.try_into().unwrap())
}

/// Move one unit from `from` to `to` (skipping overdrafts via user abort).
fn transfer<S: TxSource>(worker: &S, stat: &mut PerTxStat, from: u64, to: u64) -> bool {
    run_with_retry(worker, stat, |tx| {
        let src = tx.prepare_update(T, from.min(to))?;
        let low_is_src = from <= to;
        let v = read_u64(src);
        let new = if low_is_src {
            v.checked_sub(1).ok_or(TxError::UserAbort)?
        } else {
            v + 1
        };
        src.copy_from_slice(&new.to_le_bytes());

        let dst = tx.prepare_update(T, from.max(to))?;
        let v = read_u64(dst);
        let new = if low_is_src { v + 1 } else { v - 1 };
        dst.copy_from_slice(&new.to_le_bytes());
        Ok(())
    })
}

fn total<S: TxSource>(worker: &S) -> u64 {
    let mut sum = 0u64;
    let mut stat = PerTxStat::default();
    let ok = run_with_retry(worker, &mut stat, |tx| {
        sum = 0;
        tx.range_scan(T, 0, ACCOUNTS, None, false, |_, rec| {
            sum += read_u64(rec);
        })?;
        Ok(())
    });
    assert!(ok);
    sum
}

fn stress<E, W>(engine: Arc<E>, worker_of: impl Fn(&Arc<E>, usize) -> W + Send + Sync + 'static)
where
    E: Send + Sync + 'static,
    W: TxSource,
{
    let worker_of = Arc::new(worker_of);
    let mut handles = Vec::new();
    for id in 0..THREADS {
        let engine = Arc::clone(&engine);
        let worker_of = Arc::clone(&worker_of);
        handles.push(thread::spawn(move || {
            let worker = worker_of(&engine, id);
            let mut rng = StdRng::seed_from_u64(0xBED0 + id as u64);
            let mut stat = PerTxStat::default();
            for _ in 0..TRANSFERS {
                let from = rng.gen_range(0..ACCOUNTS);
                let mut to = rng.gen_range(0..ACCOUNTS);
                while to == from {
                    to = rng.gen_range(0..ACCOUNTS);
                }
                transfer(&worker, &mut stat, from, to);
            }
            stat
        }));
    }

    let mut merged = PerTxStat::default();
    for handle in handles {
        merged.add(&handle.join().unwrap());
    }
    assert!(merged.commits > 0);

    let checker = worker_of(&engine, 0);
    assert_eq!(total(&checker), ACCOUNTS * INITIAL);
}

#[test]
fn test_stress_silo() {
    let engine = SiloEngine::new(schema(), THREADS);
    for k in 0..ACCOUNTS {
        engine.load(T, k, &INITIAL.to_le_bytes());
    }
    // Keep the epoch clock moving while the workers run.
    let epochs = Arc::clone(engine.epochs());
    let clock = thread::spawn(move || {
        epochs.run_for(Duration::from_millis(200), Duration::from_millis(5));
    });
    stress(engine, |e, id| e.worker(id));
    clock.join().unwrap();
}

#[test]
fn test_stress_mvto() {
    let engine = MvtoEngine::new(schema(), THREADS);
    for k in 0..ACCOUNTS {
        engine.load(T, k, &INITIAL.to_le_bytes());
    }
    let timestamps = Arc::clone(engine.timestamps());
    let sweeper = thread::spawn(move || {
        timestamps.run_for(Duration::from_millis(200), Duration::from_millis(5));
    });
    stress(engine, |e, id| e.worker(id as u8));
    sweeper.join().unwrap();
}

#[test]
fn test_stress_nowait() {
    let engine = NoWaitEngine::new(schema(), THREADS);
    for k in 0..ACCOUNTS {
        engine.load(T, k, &INITIAL.to_le_bytes());
    }
    stress(engine, |e, id| e.worker(id));
}

#[test]
fn test_stress_waitdie() {
    let engine = WaitDieEngine::new(schema(), THREADS);
    for k in 0..ACCOUNTS {
        engine.load(T, k, &INITIAL.to_le_bytes());
    }
    let timestamps = Arc::clone(engine.timestamps());
    let sweeper = thread::spawn(move || {
        timestamps.run_for(Duration::from_millis(200), Duration::from_millis(5));
    });
    stress(engine, |e, id| e.worker(id as u8));
    sweeper.join().unwrap();
}
