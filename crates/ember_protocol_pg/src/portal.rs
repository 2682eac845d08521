//! Portals: bound statements with a result cursor.
//!
//! Binds that the fast path resolved to one shard are kept apart as
//! [`LightBinding`]s. They share the portal namespace but carry no cursor
//! until their first Execute.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use ember_common::datum::{Datum, OwnedRow};
use ember_common::error::{EmberResult, ExecutionError};
use ember_common::types::{FormatCode, ShardId};
use ember_planner::PlannedStatement;

use crate::statement_cache::PreparedStatement;

#[derive(Debug, Default)]
pub enum RowCursor {
    #[default]
    NotStarted,
    Running {
        rows: VecDeque<OwnedRow>,
        rows_affected: u64,
    },
    Exhausted,
    /// Execution raised an error; the portal cannot run again.
    Failed,
}

#[derive(Debug)]
pub struct Portal {
    pub name: String,
    pub statement: Arc<PreparedStatement>,
    pub planned: Arc<PlannedStatement>,
    pub params: Vec<Datum>,
    pub result_formats: Vec<FormatCode>,
    pub cursor: RowCursor,
}

/// Rows handed out by one Execute.
#[derive(Debug, Default)]
pub struct Fetch {
    pub rows: Vec<OwnedRow>,
    pub rows_affected: u64,
    /// False when rows remain after hitting the row limit.
    pub completed: bool,
}

impl Portal {
    pub fn is_started(&self) -> bool {
        !matches!(self.cursor, RowCursor::NotStarted)
    }

    /// Take up to `max_rows` rows (`<= 0` is unlimited) from a running
    /// cursor, marking it exhausted once drained.
    pub fn fetch(&mut self, max_rows: i32) -> EmberResult<Fetch> {
        match std::mem::take(&mut self.cursor) {
            RowCursor::Running {
                mut rows,
                rows_affected,
            } => {
                let limit = usize::try_from(max_rows)
                    .ok()
                    .filter(|n| *n > 0)
                    .unwrap_or(usize::MAX);
                let take = limit.min(rows.len());
                let batch: Vec<OwnedRow> = rows.drain(..take).collect();
                if rows.is_empty() {
                    self.cursor = RowCursor::Exhausted;
                    Ok(Fetch {
                        rows: batch,
                        rows_affected,
                        completed: true,
                    })
                } else {
                    self.cursor = RowCursor::Running {
                        rows,
                        rows_affected,
                    };
                    Ok(Fetch {
                        rows: batch,
                        rows_affected,
                        completed: false,
                    })
                }
            }
            RowCursor::Exhausted => {
                self.cursor = RowCursor::Exhausted;
                Ok(Fetch {
                    completed: true,
                    ..Fetch::default()
                })
            }
            RowCursor::Failed => {
                self.cursor = RowCursor::Failed;
                Err(ExecutionError::PortalCannotRun(self.name.clone()).into())
            }
            RowCursor::NotStarted => Err(ExecutionError::Internal(format!(
                "portal \"{}\" fetched before it was started",
                self.name
            ))
            .into()),
        }
    }
}

/// A Bind routed straight to one shard.
#[derive(Debug)]
pub struct LightBinding {
    pub name: String,
    pub statement: Arc<PreparedStatement>,
    pub planned: Arc<PlannedStatement>,
    pub shard: ShardId,
    pub params: Vec<Datum>,
    pub result_formats: Vec<FormatCode>,
}

impl LightBinding {
    /// Conventional portal for the same bind, not yet started.
    pub fn into_portal(self) -> Portal {
        Portal {
            name: self.name,
            statement: self.statement,
            planned: self.planned,
            params: self.params,
            result_formats: self.result_formats,
            cursor: RowCursor::NotStarted,
        }
    }
}

/// Portal lookup result for Describe/Execute.
pub enum PortalEntry {
    Conventional(Portal),
    Light(LightBinding),
}

#[derive(Debug, Default)]
pub struct PortalManager {
    portals: HashMap<String, Portal>,
    light: HashMap<String, LightBinding>,
}

impl PortalManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exists(&self, name: &str) -> bool {
        self.portals.contains_key(name) || self.light.contains_key(name)
    }

    /// Make room for a new portal called `name`: the unnamed portal is
    /// silently replaced, a named one must have been closed first.
    pub fn prepare_slot(&mut self, name: &str) -> EmberResult<()> {
        if name.is_empty() {
            self.drop_unnamed();
            Ok(())
        } else if self.exists(name) {
            Err(ExecutionError::DuplicatePortal(name.to_string()).into())
        } else {
            Ok(())
        }
    }

    pub fn insert(&mut self, portal: Portal) {
        self.light.remove(&portal.name);
        self.portals.insert(portal.name.clone(), portal);
    }

    pub fn insert_light(&mut self, binding: LightBinding) {
        self.portals.remove(&binding.name);
        self.light.insert(binding.name.clone(), binding);
    }

    /// Remove a portal for execution. Put it back with [`Self::insert`].
    pub fn take(&mut self, name: &str) -> EmberResult<PortalEntry> {
        if let Some(binding) = self.light.remove(name) {
            return Ok(PortalEntry::Light(binding));
        }
        self.portals
            .remove(name)
            .map(PortalEntry::Conventional)
            .ok_or_else(|| ExecutionError::UndefinedPortal(name.to_string()).into())
    }

    /// Statement and result formats of a portal, for Describe.
    pub fn describe(
        &self,
        name: &str,
    ) -> EmberResult<(Arc<PreparedStatement>, Vec<FormatCode>)> {
        if let Some(b) = self.light.get(name) {
            return Ok((b.statement.clone(), b.result_formats.clone()));
        }
        self.portals
            .get(name)
            .map(|p| (p.statement.clone(), p.result_formats.clone()))
            .ok_or_else(|| ExecutionError::UndefinedPortal(name.to_string()).into())
    }

    /// Idempotent: closing a missing portal is not an error.
    pub fn close(&mut self, name: &str) {
        if self.portals.remove(name).is_none() && self.light.remove(name).is_none() {
            tracing::trace!(portal = %name, "close of unknown portal ignored");
        }
    }

    pub fn drop_unnamed(&mut self) {
        self.close("");
    }

    /// Drop every portal; used when the owning transaction ends.
    pub fn clear(&mut self) {
        if !self.is_empty() {
            tracing::trace!(
                portals = self.portals.len(),
                light = self.light.len(),
                "dropping portals at transaction end"
            );
        }
        self.portals.clear();
        self.light.clear();
    }

    pub fn len(&self) -> usize {
        self.portals.len() + self.light.len()
    }

    pub fn is_empty(&self) -> bool {
        self.portals.is_empty() && self.light.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_cluster::ShardMap;
    use ember_common::catalog::Catalog;
    use ember_planner::Planner;
    use ember_sql_frontend::parse_sql;

    use crate::statement_cache::PlanContext;

    fn setup_statement() -> Arc<PreparedStatement> {
        let catalog = Catalog::new();
        let planner = Planner::new();
        let map = ShardMap::uniform(1);
        let ctx = PlanContext {
            catalog: &catalog,
            planner: &planner,
            shard_map: &map,
            light_proxy: false,
        };
        let raw = parse_sql("SELECT 1").unwrap().pop();
        Arc::new(PreparedStatement::prepare("", "SELECT 1", raw, &[], &ctx).unwrap())
    }

    fn portal(name: &str, stmt: &Arc<PreparedStatement>) -> Portal {
        Portal {
            name: name.into(),
            statement: stmt.clone(),
            planned: stmt.cached_plan().planned,
            params: Vec::new(),
            result_formats: Vec::new(),
            cursor: RowCursor::NotStarted,
        }
    }

    #[test]
    fn test_unnamed_portal_replaced() {
        let stmt = setup_statement();
        let mut pm = PortalManager::new();
        pm.prepare_slot("").unwrap();
        pm.insert(portal("", &stmt));
        pm.prepare_slot("").unwrap();
        assert!(!pm.exists(""));
    }

    #[test]
    fn test_named_portal_must_be_closed_first() {
        let stmt = setup_statement();
        let mut pm = PortalManager::new();
        pm.insert(portal("c1", &stmt));
        assert_eq!(pm.prepare_slot("c1").unwrap_err().pg_sqlstate(), "42P03");
        pm.close("c1");
        pm.close("c1");
        pm.prepare_slot("c1").unwrap();
    }

    #[test]
    fn test_fetch_suspends_and_exhausts() {
        let stmt = setup_statement();
        let mut p = portal("", &stmt);
        p.cursor = RowCursor::Running {
            rows: (0..5).map(|i| OwnedRow::new(vec![Datum::Int32(i)])).collect(),
            rows_affected: 5,
        };
        let first = p.fetch(2).unwrap();
        assert_eq!(first.rows.len(), 2);
        assert!(!first.completed);
        let rest = p.fetch(0).unwrap();
        assert_eq!(rest.rows.len(), 3);
        assert!(rest.completed);
        let again = p.fetch(0).unwrap();
        assert!(again.rows.is_empty() && again.completed);
    }

    #[test]
    fn test_failed_portal_cannot_run() {
        let stmt = setup_statement();
        let mut p = portal("c", &stmt);
        p.cursor = RowCursor::Failed;
        assert_eq!(p.fetch(0).unwrap_err().pg_sqlstate(), "55000");
    }

    #[test]
    fn test_light_binding_shares_namespace() {
        let stmt = setup_statement();
        let mut pm = PortalManager::new();
        pm.insert_light(LightBinding {
            name: "p".into(),
            statement: stmt.clone(),
            planned: stmt.cached_plan().planned,
            shard: ShardId(0),
            params: Vec::new(),
            result_formats: Vec::new(),
        });
        assert!(pm.prepare_slot("p").is_err());
        assert!(matches!(pm.take("p").unwrap(), PortalEntry::Light(_)));
        assert!(pm.take("p").is_err());
    }
}
