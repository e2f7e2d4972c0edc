//! Synthetic workload driver.
//!
//! Requests are admitted from a background task while the driver loop
//! schedules whatever is active, runs engine steps and retires finished
//! requests, so admissions really do race with in-flight steps.

use std::time::{Duration, Instant};

use anyhow::Context;
use candle_core::Device;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use specbatch_core::batch::{ScheduledRequest, SharedBatch, SlotTable};
use specbatch_core::engine::{DraftMethod, ModelExecutor, SpecDecodingStats, SpeculativeEngine};
use specbatch_core::error::BatchError;
use specbatch_core::request::RequestId;
use specbatch_core::sampling::{ProcessorSet, SamplingParams};
use specbatch_core::testing::MockExecutor;
use tracing::{debug, info};

use crate::config::{SimConfig, WorkloadConfig};

#[derive(Debug, Clone, Serialize)]
pub struct SimReport {
    pub num_requests: usize,
    pub num_steps: u64,
    pub num_generated_tokens: usize,
    pub num_discarded: usize,
    pub tokens_per_step: f64,
    pub elapsed_ms: f64,
    pub final_speculation_depth: usize,
    pub last_method: DraftMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spec_decoding: Option<SpecDecodingStats>,
}

/// One synthetic request.
#[derive(Debug, Clone)]
pub struct SyntheticRequest {
    pub req_id: RequestId,
    pub prompt_token_ids: Vec<u32>,
}

/// Cyclic prompts with a random phase, with `noise` of the tokens replaced
/// by uniform draws from the vocabulary.
pub fn generate_requests(workload: &WorkloadConfig) -> Vec<SyntheticRequest> {
    let mut rng = StdRng::seed_from_u64(workload.seed);
    (0..workload.num_requests)
        .map(|i| {
            let phase = rng.gen_range(0..workload.period);
            let prompt_token_ids = (0..workload.prompt_len as u32)
                .map(|pos| {
                    if rng.gen::<f32>() < workload.noise {
                        rng.gen_range(0..workload.vocab_size as u32)
                    } else {
                        (phase + pos) % workload.period
                    }
                })
                .collect();
            SyntheticRequest {
                req_id: RequestId::from(format!("req-{i}")),
                prompt_token_ids,
            }
        })
        .collect()
}

fn sampling_params(workload: &WorkloadConfig) -> SamplingParams {
    SamplingParams {
        temperature: workload.temperature,
        ..Default::default()
    }
}

/// Run the whole workload to completion against a mock target.
pub async fn run(config: &SimConfig) -> anyhow::Result<SimReport> {
    let workload = &config.workload;
    let period = workload.period;
    let executor = MockExecutor::new(workload.vocab_size, workload.confidence, move |t| {
        (t + 1) % period
    });
    let mut engine = SpeculativeEngine::new(
        &config.engine_config(),
        executor,
        ProcessorSet::with_defaults(None),
        &Device::Cpu,
    )
    .context("failed to build engine")?;
    engine.set_compaction(workload.compact);
    drive(&mut engine, config).await
}

/// Admit the workload and step `engine` until every request finished.
pub async fn drive<E: ModelExecutor>(
    engine: &mut SpeculativeEngine<E>,
    config: &SimConfig,
) -> anyhow::Result<SimReport> {
    let workload = config.workload.clone();
    let requests = generate_requests(&workload);
    let num_requests = requests.len();
    let start = Instant::now();

    let admitter = tokio::spawn(admit_all(
        engine.batch().clone(),
        requests,
        sampling_params(&workload),
        Duration::from_millis(workload.arrival_interval_ms),
    ));

    let mut num_finished = 0;
    let mut num_generated_tokens = 0;
    let mut num_discarded = 0;
    let mut last_method = DraftMethod::None;
    while num_finished < num_requests {
        let (scheduled, finished) = engine
            .batch()
            .with_table(|table| schedule(table, &workload));
        for req_id in &finished {
            engine.batch().remove(req_id)?;
            debug!(request_id = %req_id, "request finished");
        }
        num_finished += finished.len();

        if scheduled.is_empty() {
            if admitter.is_finished() && engine.batch().num_active() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
            continue;
        }

        let output = engine.step(&scheduled).await?;
        num_generated_tokens += output.num_new_tokens();
        num_discarded += output.discarded.len();
        last_method = output.method_used;
    }
    admitter.await.context("admission task panicked")??;

    let num_steps = engine.num_steps();
    let report = SimReport {
        num_requests,
        num_steps,
        num_generated_tokens,
        num_discarded,
        tokens_per_step: if num_steps == 0 {
            0.0
        } else {
            num_generated_tokens as f64 / num_steps as f64
        },
        elapsed_ms: start.elapsed().as_secs_f64() * 1e3,
        final_speculation_depth: engine.speculation_depth(),
        last_method,
        spec_decoding: engine.drafter().map(|_| engine.stats().clone()),
    };
    info!(
        num_steps,
        num_generated_tokens,
        tokens_per_step = report.tokens_per_step,
        elapsed_ms = report.elapsed_ms,
        "workload complete"
    );
    Ok(report)
}

async fn admit_all(
    batch: SharedBatch,
    requests: Vec<SyntheticRequest>,
    params: SamplingParams,
    interval: Duration,
) -> Result<(), BatchError> {
    for request in requests {
        loop {
            match batch.add(
                request.req_id.clone(),
                request.prompt_token_ids.clone(),
                params.clone(),
            ) {
                Ok(_) => break,
                Err(BatchError::BatchFull { .. }) => {
                    tokio::time::sleep(Duration::from_millis(1)).await
                }
                Err(e) => return Err(e),
            }
        }
        if !interval.is_zero() {
            tokio::time::sleep(interval).await;
        }
    }
    Ok(())
}

/// First-come chunked scheduling over the occupied slots.
///
/// Returns the step's schedule and the requests that are done. A request
/// is done once it produced `max_new_tokens` or filled its history.
fn schedule(table: &SlotTable, workload: &WorkloadConfig) -> (Vec<ScheduledRequest>, Vec<RequestId>) {
    let mut budget = table.max_num_batched_tokens();
    let mut scheduled = Vec::new();
    let mut finished = Vec::new();
    for slot in table.occupied_slots() {
        let Some(req_id) = table.req_id_at(slot) else {
            continue;
        };
        let num_tokens = table.num_tokens(slot);
        let num_output = num_tokens - table.num_prompt_tokens(slot);
        if num_output >= workload.max_new_tokens || num_tokens >= table.max_model_len() {
            finished.push(req_id.clone());
            continue;
        }
        let remaining = num_tokens - table.num_computed_tokens(slot);
        let n = remaining.min(budget);
        if n == 0 {
            continue;
        }
        budget -= n;
        scheduled.push(ScheduledRequest::new(req_id.clone(), n));
    }
    (scheduled, finished)
}
