//! Execution Scheduler (§4.E): admission control, warm-pool-first VM
//! acquisition, and the release policy that decides whether a VM goes back
//! into the pool, gets destroyed, or (on a guest error) stays in service.
//!
//! Grounded on `runner/src/runner.rs`'s poll loop: a `tokio::sync::Semaphore`
//! gates concurrency exactly the way `run`'s `max_concurrent` semaphore does,
//! and `execute`'s "destroy on timeout/protocol error, never on guest error"
//! split mirrors `executor::execute_job`'s always-destroy-the-sandbox
//! teardown, adapted to the spec's softer "guest errors don't poison the VM"
//! rule (the teacher always tears the sandbox down after one job; Nimbus
//! instead keeps a VM across many invocations, so only *some* outcomes
//! destroy it).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nimbus_proto::InitPayload;
use nimbus_snapshot::{Function, MetadataStore, SnapshotStatus, TelemetrySink};
use nimbus_transport::{GUEST_PORT, Transport};
use nimbus_vm::{VmManager, VmState};
use tokio::time::Instant as TokioInstant;
use tracing::{info, warn};

use crate::error::{Result, SchedulerError};
use crate::model::{ExecuteOutcome, FingerprintStats, WarmEntry};
use crate::pool::FunctionState;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub warm_cap_per_fingerprint: usize,
    pub idle_ttl: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            warm_cap_per_fingerprint: 4,
            idle_ttl: Duration::from_secs(600),
        }
    }
}

pub struct Scheduler {
    vms: Arc<VmManager>,
    metadata: Arc<dyn MetadataStore>,
    telemetry: Arc<dyn TelemetrySink>,
    config: SchedulerConfig,
    states: tokio::sync::RwLock<HashMap<(String, u64), Arc<FunctionState>>>,
}

struct Acquired {
    vm: nimbus_vm::Vm,
    transport: Transport,
    cold_start: bool,
}

impl Scheduler {
    pub fn new(
        vms: Arc<VmManager>,
        metadata: Arc<dyn MetadataStore>,
        telemetry: Arc<dyn TelemetrySink>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            vms,
            metadata,
            telemetry,
            config,
            states: tokio::sync::RwLock::new(HashMap::new()),
        }
    }

    async fn state_for(&self, function: &Function) -> Arc<FunctionState> {
        let key = (function.id.clone(), function.version);
        if let Some(state) = self.states.read().await.get(&key) {
            return Arc::clone(state);
        }
        let mut states = self.states.write().await;
        Arc::clone(states.entry(key).or_insert_with(|| {
            Arc::new(FunctionState::new(
                function.runtime.clone(),
                function.max_concurrency,
                self.config.warm_cap_per_fingerprint,
                self.config.idle_ttl,
            ))
        }))
    }

    /// §4.E's full per-invocation protocol.
    pub async fn execute(
        &self,
        function: &Function,
        payload: serde_json::Value,
        deadline: TokioInstant,
    ) -> Result<ExecuteOutcome> {
        let state = self.state_for(function).await;

        let _permit = match &state.admission {
            Some(sem) => Some(
                tokio::time::timeout_at(deadline, Arc::clone(sem).acquire_owned())
                    .await
                    .map_err(|_| SchedulerError::AdmissionTimeout)?
                    .map_err(|_| SchedulerError::AdmissionTimeout)?,
            ),
            None => None,
        };

        state.mark_busy();
        let acquired = self.acquire_vm(function, &state, deadline).await;
        let acquired = match acquired {
            Ok(a) => a,
            Err(e) => {
                state.mark_idle();
                return Err(e);
            }
        };

        let Acquired {
            vm,
            mut transport,
            cold_start,
        } = acquired;

        let start = Instant::now();
        let result = transport.execute(payload, deadline).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        self.release(function, &state, vm, transport, cold_start, &result)
            .await;
        state.mark_idle();

        match result {
            Ok(resp) => Ok(ExecuteOutcome {
                status_code: resp.status_code,
                body: resp.body,
                duration_ms,
                billed_time_ms: resp.billed_time_ms,
                cold_start,
                error: resp.error,
            }),
            Err(nimbus_transport::TransportError::Guest(msg)) => Ok(ExecuteOutcome {
                status_code: 500,
                body: serde_json::Value::Null,
                duration_ms,
                billed_time_ms: duration_ms,
                cold_start,
                error: Some(msg),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn acquire_vm(
        &self,
        function: &Function,
        state: &FunctionState,
        deadline: TokioInstant,
    ) -> Result<Acquired> {
        // 1. Warm hit. The pool is shared by every `env_vars_hash` under this
        // `(function_id, version)`, so a popped entry may simply belong to a
        // different fingerprint rather than be stale — those go back in the
        // pool instead of being destroyed.
        let mut skipped = Vec::new();
        let hit = loop {
            let entry = state.warm_pool.lock().await.pop_back();
            let Some(entry) = entry else { break None };
            let fingerprint_matches =
                entry.code_hash == function.code_hash && entry.env_vars_hash == function.env_vars_hash;
            match self.vms.get(entry.vm.vm_id).await {
                Some(vm) if vm.state == VmState::Running && fingerprint_matches => break Some((vm, entry.transport)),
                Some(_) if !fingerprint_matches => {
                    skipped.push(entry);
                    continue;
                }
                _ => {
                    warn!(vm_id = %entry.vm.vm_id, "discarding stale warm entry");
                    self.vms.destroy(entry.vm.vm_id).await;
                    continue;
                }
            }
        };

        if !skipped.is_empty() {
            let mut pool = state.warm_pool.lock().await;
            for entry in skipped {
                pool.push_back(entry);
            }
        }

        if let Some((vm, transport)) = hit {
            self.telemetry
                .emit_event("vm.warm_hit", &[("function_id", function.id.as_str())], serde_json::Value::Null);
            return Ok(Acquired {
                vm,
                transport,
                cold_start: false,
            });
        }

        // 2. Snapshot restore.
        if let Some(mut snapshot) = self
            .metadata
            .get_snapshot(&function.id, function.version, &function.env_vars_hash)
            .await
            && snapshot.status == SnapshotStatus::Ready
        {
            let restore_start = Instant::now();
            let restored = self
                .vms
                .restore(
                    std::path::Path::new(&snapshot.mem_path),
                    std::path::Path::new(&snapshot.state_path),
                    &function.runtime,
                )
                .await;
            match restored {
                Ok(vm) => {
                    let latency_ms = restore_start.elapsed().as_secs_f64() * 1000.0;
                    snapshot.record_restore(latency_ms);
                    self.metadata.upsert_snapshot(snapshot).await;
                    self.telemetry.emit_event(
                        "vm.restore",
                        &[("function_id", function.id.as_str())],
                        serde_json::json!({"latency_ms": latency_ms}),
                    );
                    let transport = Transport::connect(&vm.vsock_uds_path, GUEST_PORT, deadline).await?;
                    return Ok(Acquired {
                        vm,
                        transport,
                        cold_start: true,
                    });
                }
                Err(e) => {
                    warn!(error = %e, "snapshot restore failed, falling back to cold build");
                }
            }
        }

        // 3. Cold build.
        self.cold_build(function, deadline).await
    }

    async fn cold_build(&self, function: &Function, deadline: TokioInstant) -> Result<Acquired> {
        let vm = self
            .vms
            .create(&function.runtime, function.memory_mib, function.vcpus)
            .await?;

        let mut transport = match Transport::connect(&vm.vsock_uds_path, GUEST_PORT, deadline).await {
            Ok(t) => t,
            Err(e) => {
                self.vms.destroy(vm.vm_id).await;
                return Err(e.into());
            }
        };

        let payload = InitPayload {
            function_id: function.id.clone(),
            handler: function.handler.clone(),
            code_bytes: function.code_bytes.clone(),
            runtime: function.runtime.clone(),
            env_vars: function.env_vars.clone(),
            memory_limit_mib: function.memory_mib,
            timeout_sec: function.timeout_sec,
        };
        match transport.init(payload, deadline).await {
            Ok(resp) if resp.ok => {}
            Ok(resp) => {
                self.vms.destroy(vm.vm_id).await;
                return Err(SchedulerError::ProtocolError(
                    resp.error.unwrap_or_else(|| "guest rejected init".into()),
                ));
            }
            Err(e) => {
                self.vms.destroy(vm.vm_id).await;
                return Err(e.into());
            }
        }

        self.telemetry
            .emit_event("vm.cold_start", &[("function_id", function.id.as_str())], serde_json::Value::Null);
        Ok(Acquired {
            vm,
            transport,
            cold_start: true,
        })
    }

    /// §4.E step 4: decide the VM's fate based on how `execute` went.
    async fn release(
        &self,
        function: &Function,
        state: &FunctionState,
        vm: nimbus_vm::Vm,
        transport: Transport,
        _cold_start: bool,
        result: &std::result::Result<nimbus_proto::ExecuteResponse, nimbus_transport::TransportError>,
    ) {
        match result {
            Ok(_) | Err(nimbus_transport::TransportError::Guest(_)) => {
                let pool_len = state.warm_pool.lock().await.len();
                let aged_out = false; // freshly used, idle clock starts now.
                if pool_len < state.warm_cap && !aged_out {
                    self.vms.mark_used(vm.vm_id).await;
                    state.warm_pool.lock().await.push_back(WarmEntry {
                        vm,
                        transport,
                        code_hash: function.code_hash.clone(),
                        env_vars_hash: function.env_vars_hash.clone(),
                        idle_since: Instant::now(),
                    });
                } else {
                    transport.close();
                    self.vms.destroy(vm.vm_id).await;
                }
            }
            Err(_) => {
                transport.close();
                self.vms.destroy(vm.vm_id).await;
            }
        }
    }

    /// Background sweeper: evict idle VMs past `idle_ttl` (§4.E).
    pub async fn sweep_idle(&self) {
        let states: Vec<Arc<FunctionState>> = self.states.read().await.values().cloned().collect();
        for state in states {
            let mut expired = Vec::new();
            {
                let mut pool = state.warm_pool.lock().await;
                let now = Instant::now();
                let mut kept = std::collections::VecDeque::new();
                while let Some(entry) = pool.pop_front() {
                    if now.duration_since(entry.idle_since) >= state.idle_ttl {
                        expired.push(entry);
                    } else {
                        kept.push_back(entry);
                    }
                }
                *pool = kept;
            }
            for entry in expired {
                info!(vm_id = %entry.vm.vm_id, "evicting idle vm past ttl");
                entry.transport.close();
                self.vms.destroy(entry.vm.vm_id).await;
            }
        }
    }

    /// `stats()` (§6.1): aggregated per runtime tag, across every
    /// `(function, version)` fingerprint that shares it.
    pub async fn stats(&self) -> HashMap<String, FingerprintStats> {
        let mut out = HashMap::new();
        for state in self.states.read().await.values() {
            let warm = state.warm_pool.lock().await.len();
            let busy = state.busy_count.load(std::sync::atomic::Ordering::Acquire);
            let entry = out
                .entry(state.runtime.clone())
                .or_insert(FingerprintStats::default());
            entry.warm += warm;
            entry.busy += busy;
            entry.total += warm + busy as usize;
            entry.max = entry.max.max(state.max_concurrency);
        }
        out
    }

    /// Drain every warm pool and destroy every VM in it (`shutdown`, §6.1).
    pub async fn shutdown(&self) {
        let states: Vec<Arc<FunctionState>> = self.states.write().await.drain().map(|(_, v)| v).collect();
        for state in states {
            let mut pool = state.warm_pool.lock().await;
            while let Some(entry) = pool.pop_front() {
                entry.transport.close();
                self.vms.destroy(entry.vm.vm_id).await;
            }
        }
    }
}
