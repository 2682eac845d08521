//! Coordinator-side execution of planned statements.
//!
//! The full path scatters a plan to every shard that may hold matching
//! rows and gathers the replies. The routed path ships a plan plus one or
//! more parameter sets to a single shard in one request.

use std::sync::Arc;

use ember_common::catalog::Catalog;
use ember_common::datum::Datum;
use ember_common::error::{ClusterError, EmberError, EmberResult, SqlError};
use ember_common::interrupt::InterruptCheck;
use ember_common::types::{ShardId, TxnId};
use ember_executor::{eval_values, DispatchMode, ExecutionResult};
use ember_planner::{ExecTarget, PhysicalPlan, PlannedStatement};

use crate::shard_map::ShardMap;
use crate::transport::{ShardDdl, ShardLink, ShardRequest, ShardTransport};

pub struct DistributedExecutor {
    catalog: Arc<Catalog>,
    shard_map: Arc<ShardMap>,
    transport: Arc<dyn ShardTransport>,
}

impl DistributedExecutor {
    pub fn new(
        catalog: Arc<Catalog>,
        shard_map: Arc<ShardMap>,
        transport: Arc<dyn ShardTransport>,
    ) -> Self {
        Self {
            catalog,
            shard_map,
            transport,
        }
    }

    pub fn shard_map(&self) -> &Arc<ShardMap> {
        &self.shard_map
    }

    /// Run `stmt` on the full path. Link leases taken for the command are
    /// pushed onto `leases` and stay held until the caller releases them.
    pub fn execute(
        &self,
        stmt: &PlannedStatement,
        params: &[Datum],
        txn: TxnId,
        leases: &mut Vec<ShardLink>,
        interrupts: &dyn InterruptCheck,
    ) -> EmberResult<ExecutionResult> {
        interrupts.check_for_interrupts()?;
        match (stmt.target, stmt.plan.as_ref()) {
            (_, PhysicalPlan::Empty) => Ok(ExecutionResult::default()),
            (ExecTarget::Coordinator, PhysicalPlan::Values { exprs }) => {
                let row = eval_values(exprs, params)?;
                Ok(ExecutionResult {
                    rows: vec![row],
                    rows_affected: 1,
                })
            }
            (ExecTarget::Coordinator, other) => Err(EmberError::Internal(format!(
                "plan {other:?} is not executable on the coordinator"
            ))),
            (ExecTarget::AllShards, _) => {
                let mut total = ExecutionResult::default();
                for shard in self.transport.shard_ids() {
                    let part = self.dispatch(
                        shard,
                        stmt.plan.clone(),
                        vec![params.to_vec()],
                        DispatchMode::Broadcast,
                        txn,
                        leases,
                        interrupts,
                    )?;
                    total.merge(part);
                }
                Ok(total)
            }
            (ExecTarget::AnyReplica, _) => {
                let shard = self
                    .transport
                    .shard_ids()
                    .first()
                    .copied()
                    .ok_or(ClusterError::ShardNotFound(0))?;
                self.dispatch(
                    shard,
                    stmt.plan.clone(),
                    vec![params.to_vec()],
                    DispatchMode::Broadcast,
                    txn,
                    leases,
                    interrupts,
                )
            }
            (ExecTarget::AllReplicas, _) => {
                let mut first = None;
                for shard in self.transport.shard_ids() {
                    let part = self.dispatch(
                        shard,
                        stmt.plan.clone(),
                        vec![params.to_vec()],
                        DispatchMode::Routed,
                        txn,
                        leases,
                        interrupts,
                    )?;
                    first.get_or_insert(part);
                }
                Ok(first.unwrap_or_default())
            }
        }
    }

    /// Ship `plan` with every parameter set in `param_sets` to one shard as
    /// a single request.
    pub fn dispatch_routed(
        &self,
        shard: ShardId,
        plan: Arc<PhysicalPlan>,
        param_sets: Vec<Vec<Datum>>,
        txn: TxnId,
        leases: &mut Vec<ShardLink>,
        interrupts: &dyn InterruptCheck,
    ) -> EmberResult<ExecutionResult> {
        interrupts.check_for_interrupts()?;
        self.dispatch(
            shard,
            plan,
            param_sets,
            DispatchMode::Routed,
            txn,
            leases,
            interrupts,
        )
    }

    /// Apply CREATE TABLE / DROP TABLE to the catalog and every shard.
    pub fn execute_ddl(&self, plan: &PhysicalPlan) -> EmberResult<()> {
        match plan {
            PhysicalPlan::CreateTable {
                name,
                columns,
                distribution,
                if_not_exists,
            } => {
                if *if_not_exists && self.catalog.get_table(name).is_some() {
                    tracing::info!(table = %name, "relation already exists, skipping");
                    return Ok(());
                }
                let schema = self
                    .catalog
                    .create_table(name, columns.clone(), *distribution)?;
                let ddl = ShardDdl::CreateTable(schema);
                for shard in self.transport.shard_ids() {
                    self.transport.apply_ddl(shard, &ddl)?;
                }
                Ok(())
            }
            PhysicalPlan::DropTable { names, if_exists } => {
                for name in names {
                    let Some(schema) = self.catalog.drop_table(name) else {
                        if *if_exists {
                            tracing::info!(table = %name, "relation does not exist, skipping");
                            continue;
                        }
                        return Err(SqlError::UnknownTable(name.clone()).into());
                    };
                    let ddl = ShardDdl::DropTable(schema.id);
                    for shard in self.transport.shard_ids() {
                        self.transport.apply_ddl(shard, &ddl)?;
                    }
                }
                Ok(())
            }
            other => Err(EmberError::Internal(format!("{other:?} is not DDL"))),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch(
        &self,
        shard: ShardId,
        plan: Arc<PhysicalPlan>,
        param_sets: Vec<Vec<Datum>>,
        mode: DispatchMode,
        txn: TxnId,
        leases: &mut Vec<ShardLink>,
        interrupts: &dyn InterruptCheck,
    ) -> EmberResult<ExecutionResult> {
        let idx = match leases.iter().position(|l| l.shard() == shard) {
            Some(idx) => idx,
            None => {
                leases.push(self.transport.acquire_link(shard)?);
                leases.len() - 1
            }
        };
        let request = ShardRequest {
            txn,
            plan,
            param_sets,
            mode,
        };
        tracing::trace!(%shard, %txn, sets = request.param_sets.len(), ?mode, "shard dispatch");
        let result = self.transport.dispatch(&leases[idx], &request, interrupts);
        if let Err(EmberError::Cluster(ClusterError::LinkFailed { sent: true, .. })) = &result {
            self.transport.reset_link(shard);
            leases.swap_remove(idx);
        }
        result
    }
}
