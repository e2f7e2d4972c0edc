//! Stress tests for admission and cancellation racing the step cycle.
//!
//! Intake tasks admit and cancel requests on other worker threads while
//! the engine steps; the executor sleeps inside `execute` so removals land
//! mid-step. The table must stay consistent after every step and no result
//! may be committed to a request that was replaced in its slot.
//!
//! Run the long variant: cargo test --test concurrent_admission -- --ignored

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use candle_core::Device;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use specbatch_core::batch::{InputBatch, ScheduledRequest, SharedBatch};
use specbatch_core::config::{BatchConfig, EngineConfig, SpeculativeConfig, SpeculativeMethod};
use specbatch_core::engine::spec_decode::{DraftProposal, TargetLogprobs};
use specbatch_core::engine::{ModelExecutor, SpeculativeEngine};
use specbatch_core::error::{BatchError, ExecutorError};
use specbatch_core::request::RequestId;
use specbatch_core::sampling::{ProcessorSet, SamplingParams};
use specbatch_core::testing::{cyclic_tokens, MockExecutor};
use tokio::sync::Mutex;

// ─── Test infrastructure ────────────────────────────────────────────────────

/// Target that takes a little wall time per step.
struct SlowExecutor {
    inner: MockExecutor,
    delay: Duration,
}

#[async_trait]
impl ModelExecutor for SlowExecutor {
    async fn execute(
        &self,
        batch: &InputBatch,
        proposal: &DraftProposal,
    ) -> Result<TargetLogprobs, ExecutorError> {
        tokio::time::sleep(self.delay).await;
        self.inner.execute(batch, proposal).await
    }
}

struct Outcome {
    finished: usize,
    cancelled: usize,
    discarded: usize,
}

async fn admit(batch: SharedBatch, ids: Vec<String>, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    for id in ids {
        let prompt = cyclic_tokens(4, rng.gen_range(4..16));
        loop {
            match batch.add(id.as_str(), prompt.clone(), SamplingParams::greedy()) {
                Ok(_) => break,
                Err(BatchError::BatchFull { .. }) => {
                    tokio::time::sleep(Duration::from_micros(200)).await
                }
                Err(e) => panic!("admission failed: {e}"),
            }
        }
        tokio::time::sleep(Duration::from_micros(rng.gen_range(0..500))).await;
    }
}

async fn cancel(batch: SharedBatch, ids: Vec<String>, cancelled: Arc<Mutex<HashSet<String>>>, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    for id in ids {
        // Wait for the request to show up, then pull it at a random time.
        for _ in 0..2_000 {
            if batch.contains(&RequestId::from(id.as_str())) {
                break;
            }
            tokio::time::sleep(Duration::from_micros(100)).await;
        }
        tokio::time::sleep(Duration::from_micros(rng.gen_range(0..2_000))).await;
        if batch.remove(&RequestId::from(id.as_str())).is_ok() {
            cancelled.lock().await.insert(id);
        }
    }
}

async fn run_stress(num_requests: usize, max_new_tokens: usize, seed: u64) -> Outcome {
    let config = EngineConfig {
        batch: BatchConfig {
            max_num_reqs: 8,
            max_model_len: 256,
            max_num_batched_tokens: 128,
        },
        speculative: Some(SpeculativeConfig {
            method: SpeculativeMethod::Suffix,
            num_speculative_tokens: 3,
            seed: Some(seed),
            ..Default::default()
        }),
    };
    let executor = SlowExecutor {
        inner: MockExecutor::cycle(16, 4),
        delay: Duration::from_micros(300),
    };
    let mut engine = SpeculativeEngine::new(&config, executor, ProcessorSet::with_defaults(None), &Device::Cpu)
        .unwrap();

    let ids: Vec<String> = (0..num_requests).map(|i| format!("req-{i}")).collect();
    let (even, odd): (Vec<_>, Vec<_>) = ids.iter().cloned().enumerate().partition(|(i, _)| i % 2 == 0);
    let even: Vec<String> = even.into_iter().map(|(_, id)| id).collect();
    let odd: Vec<String> = odd.into_iter().map(|(_, id)| id).collect();
    let victims: Vec<String> = ids.iter().step_by(5).cloned().collect();

    let cancelled = Arc::new(Mutex::new(HashSet::new()));
    let intake = [
        tokio::spawn(admit(engine.batch().clone(), even, seed)),
        tokio::spawn(admit(engine.batch().clone(), odd, seed + 1)),
        tokio::spawn(cancel(engine.batch().clone(), victims, cancelled.clone(), seed + 2)),
    ];

    let mut finished = HashSet::new();
    let mut discarded = 0;
    for _ in 0..20_000 {
        // Retire requests that reached their budget.
        let done: Vec<RequestId> = engine.batch().with_table(|table| {
            table
                .occupied_slots()
                .into_iter()
                .filter(|&slot| table.num_tokens(slot) - table.num_prompt_tokens(slot) >= max_new_tokens)
                .filter_map(|slot| table.req_id_at(slot).cloned())
                .collect()
        });
        for id in done {
            if engine.batch().remove(&id).is_ok() {
                finished.insert(id.as_str().to_string());
            }
        }

        let cancelled_count = cancelled.lock().await.len();
        if intake.iter().all(|h| h.is_finished())
            && engine.batch().num_active() == 0
            && finished.len() + cancelled_count == num_requests
        {
            break;
        }

        let scheduled: Vec<ScheduledRequest> = engine.batch().with_table(|table| {
            table
                .occupied_slots()
                .into_iter()
                .filter_map(|slot| {
                    let remaining = table.num_tokens(slot) - table.num_computed_tokens(slot);
                    let id = table.req_id_at(slot)?.clone();
                    (remaining > 0).then(|| ScheduledRequest::new(id, remaining))
                })
                .collect()
        });
        if scheduled.is_empty() {
            tokio::time::sleep(Duration::from_micros(100)).await;
            continue;
        }
        match engine.step(&scheduled).await {
            Ok(out) => {
                for i in 0..out.num_reqs() {
                    assert!(out.num_accepted[i] <= out.num_proposed[i]);
                    assert!(out.num_proposed[i] <= 3);
                }
                discarded += out.discarded.len();
            }
            // A cancellation can land between scheduling and step start.
            Err(e) => assert!(e.to_string().contains("not active"), "unexpected step error: {e}"),
        }
        engine.batch().with_table(|t| t.check_invariants()).unwrap();
    }

    for handle in intake {
        handle.await.unwrap();
    }
    let cancelled = cancelled.lock().await;
    assert!(finished.is_disjoint(&cancelled));
    Outcome {
        finished: finished.len(),
        cancelled: cancelled.len(),
        discarded,
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn admissions_and_cancellations_race_steps() {
    let outcome = run_stress(40, 8, 1).await;
    assert_eq!(outcome.finished + outcome.cancelled, 40);
    assert!(outcome.finished > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[ignore]
async fn long_running_intake_stress() {
    let outcome = run_stress(1_000, 32, 7).await;
    assert_eq!(outcome.finished + outcome.cancelled, 1_000);
    println!(
        "finished={} cancelled={} discarded={}",
        outcome.finished, outcome.cancelled, outcome.discarded
    );
}
