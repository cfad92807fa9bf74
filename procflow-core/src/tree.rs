//! Execution Tree Manager: the in-memory working set for one process
//! instance.
//!
//! The tree is an arena of `Execution` records addressed by id, with an
//! explicit parent reference and a child index maintained alongside. One
//! interpreter run loads the tree, mutates it freely, and flushes everything
//! as a single [`TreeDelta`]; the store applies the delta atomically with a
//! version check per touched record. A conflict anywhere fails the whole
//! commit and the enclosing operation re-runs from its last durable
//! checkpoint. Jobs and event subscriptions created while the tree is open
//! travel in the same delta, so a suspended execution and its continuation
//! job are never persisted apart.

use crate::definition::ProcessDefinition;
use crate::error::{EngineError, StoreError};
use crate::store::{EngineStore, TreeDelta};
use crate::types::*;
use std::collections::{BTreeMap, HashMap, HashSet};
use uuid::Uuid;

/// Result of one arrival at a join barrier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinOutcome {
    /// More siblings are still on their way.
    Waiting,
    /// This arrival completed the barrier; the counter has been reset.
    Complete,
}

pub struct ExecutionTree {
    process_instance_id: ExecutionId,
    nodes: HashMap<ExecutionId, Execution>,
    children: HashMap<ExecutionId, Vec<ExecutionId>>,
    inserted: HashSet<ExecutionId>,
    dirty: HashSet<ExecutionId>,
    removed: Vec<(ExecutionId, u64)>,
    created_jobs: Vec<Job>,
    updated_jobs: Vec<Job>,
    deleted_jobs: Vec<JobId>,
    created_subscriptions: Vec<EventSubscription>,
    deleted_subscriptions: Vec<SubscriptionId>,
}

impl ExecutionTree {
    // ── Construction ──

    /// Create the tree for a brand-new instance: a single root execution,
    /// scoped, positioned on the definition's initial activity.
    pub fn new_root(
        def: &ProcessDefinition,
        business_key: Option<String>,
        tenant_id: Option<String>,
        variables: VariableMap,
    ) -> Self {
        let id = Uuid::now_v7();
        let root = Execution {
            id,
            parent_id: None,
            process_instance_id: id,
            process_definition_id: def.id.clone(),
            business_key,
            tenant_id,
            activity_id: Some(def.initial.clone()),
            transition_id: None,
            is_scope: true,
            is_concurrent: false,
            is_active: true,
            suspended: false,
            activity_started: false,
            variables,
            join_arrivals: BTreeMap::new(),
            version: 0,
        };
        let mut tree = Self::empty(id);
        tree.children.insert(id, Vec::new());
        tree.inserted.insert(id);
        tree.nodes.insert(id, root);
        tree
    }

    /// Load the persisted tree of an instance. `None` if no executions exist
    /// (instance never started or already ended).
    pub async fn load(
        store: &dyn EngineStore,
        process_instance_id: ExecutionId,
    ) -> Result<Option<Self>, StoreError> {
        let mut executions = store.instance_executions(process_instance_id).await?;
        if executions.is_empty() {
            return Ok(None);
        }
        // v7 ids are time-ordered; sorting restores creation order, which
        // keeps the child index deterministic across loads.
        executions.sort_by_key(|e| e.id);
        let mut tree = Self::empty(process_instance_id);
        for e in &executions {
            tree.children.entry(e.id).or_default();
            if let Some(parent) = e.parent_id {
                tree.children.entry(parent).or_default().push(e.id);
            }
        }
        for e in executions {
            tree.nodes.insert(e.id, e);
        }
        Ok(Some(tree))
    }

    fn empty(process_instance_id: ExecutionId) -> Self {
        Self {
            process_instance_id,
            nodes: HashMap::new(),
            children: HashMap::new(),
            inserted: HashSet::new(),
            dirty: HashSet::new(),
            removed: Vec::new(),
            created_jobs: Vec::new(),
            updated_jobs: Vec::new(),
            deleted_jobs: Vec::new(),
            created_subscriptions: Vec::new(),
            deleted_subscriptions: Vec::new(),
        }
    }

    // ── Lookup ──

    pub fn process_instance_id(&self) -> ExecutionId {
        self.process_instance_id
    }

    /// All executions destroyed: the instance has ended.
    pub fn is_ended(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: ExecutionId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn get(&self, id: ExecutionId) -> Result<&Execution, EngineError> {
        self.nodes
            .get(&id)
            .ok_or_else(|| EngineError::structural(format!("execution {id} not in tree")))
    }

    /// Mutable access; the record is marked dirty and flushed with a version
    /// check on commit.
    pub fn get_mut(&mut self, id: ExecutionId) -> Result<&mut Execution, EngineError> {
        let node = self
            .nodes
            .get_mut(&id)
            .ok_or_else(|| EngineError::structural(format!("execution {id} not in tree")))?;
        self.dirty.insert(id);
        Ok(node)
    }

    pub fn children(&self, id: ExecutionId) -> Vec<ExecutionId> {
        self.children.get(&id).cloned().unwrap_or_default()
    }

    pub fn executions(&self) -> impl Iterator<Item = &Execution> {
        self.nodes.values()
    }

    /// Leaf executions: the set of live tokens.
    pub fn leaves(&self) -> Vec<ExecutionId> {
        self.nodes
            .keys()
            .copied()
            .filter(|id| self.children.get(id).map(Vec::is_empty).unwrap_or(true))
            .collect()
    }

    // ── Structure ──

    /// Create a child execution under `parent`, inheriting instance
    /// identity and tenant.
    pub fn create_child(
        &mut self,
        parent: ExecutionId,
        concurrent: bool,
        scope: bool,
    ) -> Result<ExecutionId, EngineError> {
        let parent_exec = self.get(parent)?;
        let child = Execution {
            id: Uuid::now_v7(),
            parent_id: Some(parent),
            process_instance_id: parent_exec.process_instance_id,
            process_definition_id: parent_exec.process_definition_id.clone(),
            business_key: None,
            tenant_id: parent_exec.tenant_id.clone(),
            activity_id: None,
            transition_id: None,
            is_scope: scope,
            is_concurrent: concurrent,
            is_active: true,
            suspended: parent_exec.suspended,
            activity_started: false,
            variables: VariableMap::new(),
            join_arrivals: BTreeMap::new(),
            version: 0,
        };
        let id = child.id;
        self.children.entry(parent).or_default().push(id);
        self.children.insert(id, Vec::new());
        self.inserted.insert(id);
        self.nodes.insert(id, child);
        Ok(id)
    }

    /// Fork `n` concurrent children under a scope (parallel gateway,
    /// multi-instance). The scope itself becomes an inactive placeholder.
    pub fn fork(&mut self, scope: ExecutionId, n: usize) -> Result<Vec<ExecutionId>, EngineError> {
        let mut ids = Vec::with_capacity(n);
        for _ in 0..n {
            ids.push(self.create_child(scope, true, false)?);
        }
        let parent = self.get_mut(scope)?;
        parent.is_active = false;
        Ok(ids)
    }

    /// Record one arrival at the join barrier `gateway_id` owned by the
    /// scope `scope`. The counter lives on the scope record, so two racing
    /// arrivals cannot both observe "last": whichever commit loses the
    /// version check re-runs and sees the other's count.
    pub fn join_arrive(
        &mut self,
        scope: ExecutionId,
        gateway_id: &str,
        expected: u16,
    ) -> Result<JoinOutcome, EngineError> {
        let scope_exec = self.get_mut(scope)?;
        let count = scope_exec
            .join_arrivals
            .entry(gateway_id.to_string())
            .or_insert(0);
        *count += 1;
        if *count >= expected {
            scope_exec.join_arrivals.remove(gateway_id);
            Ok(JoinOutcome::Complete)
        } else {
            Ok(JoinOutcome::Waiting)
        }
    }

    /// Remove a leaf execution. Destroying a node with live children is a
    /// structural fault: children are always destroyed first.
    pub fn destroy(&mut self, id: ExecutionId) -> Result<(), EngineError> {
        if !self.children(id).is_empty() {
            return Err(EngineError::structural(format!(
                "execution {id} destroyed before its children"
            )));
        }
        let node = self
            .nodes
            .remove(&id)
            .ok_or_else(|| EngineError::structural(format!("execution {id} not in tree")))?;
        self.children.remove(&id);
        if let Some(parent) = node.parent_id {
            if let Some(siblings) = self.children.get_mut(&parent) {
                siblings.retain(|&c| c != id);
            }
        }
        self.dirty.remove(&id);
        if !self.inserted.remove(&id) {
            self.removed.push((id, node.version));
        }
        Ok(())
    }

    /// Ids of the subtree rooted at `id`, children before parents. The
    /// traversal order for cascade destruction.
    pub fn subtree_postorder(&self, id: ExecutionId) -> Vec<ExecutionId> {
        let mut out = Vec::new();
        self.postorder_into(id, &mut out);
        out
    }

    fn postorder_into(&self, id: ExecutionId, out: &mut Vec<ExecutionId>) {
        for child in self.children(id) {
            self.postorder_into(child, out);
        }
        out.push(id);
    }

    /// Re-home an execution under a new parent (migration only).
    pub fn reparent(&mut self, id: ExecutionId, new_parent: ExecutionId) -> Result<(), EngineError> {
        if !self.contains(new_parent) {
            return Err(EngineError::structural(format!(
                "reparent target {new_parent} not in tree"
            )));
        }
        let old_parent = {
            let node = self.get_mut(id)?;
            let old = node.parent_id;
            node.parent_id = Some(new_parent);
            old
        };
        if let Some(old) = old_parent {
            if let Some(siblings) = self.children.get_mut(&old) {
                siblings.retain(|&c| c != id);
            }
        }
        self.children.entry(new_parent).or_default().push(id);
        Ok(())
    }

    // ── Variables ──

    /// Nearest scope execution at or above `id`.
    pub fn nearest_scope(&self, id: ExecutionId) -> Result<ExecutionId, EngineError> {
        let mut cur = id;
        loop {
            let e = self.get(cur)?;
            if e.is_scope {
                return Ok(cur);
            }
            cur = e.parent_id.ok_or_else(|| {
                EngineError::structural(format!("execution {id} has no enclosing scope"))
            })?;
        }
    }

    /// Write into the nearest enclosing scope frame.
    pub fn set_variable(
        &mut self,
        id: ExecutionId,
        name: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<(), EngineError> {
        let scope = self.nearest_scope(id)?;
        self.get_mut(scope)?.variables.insert(name.into(), value);
        Ok(())
    }

    /// Write an execution-local value that shadows the enclosing scope.
    pub fn set_variable_local(
        &mut self,
        id: ExecutionId,
        name: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<(), EngineError> {
        self.get_mut(id)?.variables.insert(name.into(), value);
        Ok(())
    }

    /// Write into the scope *above* the execution's own frame. Output
    /// mappings of a completing scope land in its parent.
    pub fn set_variable_outer(
        &mut self,
        id: ExecutionId,
        name: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<(), EngineError> {
        let exec = self.get(id)?;
        let start = if exec.is_scope {
            exec.parent_id.ok_or_else(|| {
                EngineError::structural(format!("execution {id} has no outer scope"))
            })?
        } else {
            id
        };
        let scope = self.nearest_scope(start)?;
        self.get_mut(scope)?.variables.insert(name.into(), value);
        Ok(())
    }

    /// Resolve a variable by walking from the execution to the root: local
    /// values first, then each enclosing scope. Inner frames shadow outer
    /// ones.
    pub fn get_variable(&self, id: ExecutionId, name: &str) -> Option<&serde_json::Value> {
        let mut cur = Some(id);
        while let Some(c) = cur {
            let e = self.nodes.get(&c)?;
            if let Some(v) = e.variables.get(name) {
                return Some(v);
            }
            cur = e.parent_id;
        }
        None
    }

    /// Merged view of everything visible to an execution, outer frames
    /// overridden by inner ones.
    pub fn visible_variables(&self, id: ExecutionId) -> VariableMap {
        let mut chain = Vec::new();
        let mut cur = Some(id);
        while let Some(c) = cur {
            match self.nodes.get(&c) {
                Some(e) => {
                    chain.push(c);
                    cur = e.parent_id;
                }
                None => break,
            }
        }
        let mut merged = VariableMap::new();
        for c in chain.into_iter().rev() {
            if let Some(e) = self.nodes.get(&c) {
                for (k, v) in &e.variables {
                    merged.insert(k.clone(), v.clone());
                }
            }
        }
        merged
    }

    // ── Jobs and subscriptions (same transaction) ──

    pub fn create_job(&mut self, job: Job) {
        self.created_jobs.push(job);
    }

    pub fn update_job(&mut self, job: Job) {
        self.updated_jobs.push(job);
    }

    pub fn delete_job(&mut self, id: JobId) {
        self.deleted_jobs.push(id);
    }

    pub fn created_jobs(&self) -> &[Job] {
        &self.created_jobs
    }

    pub fn subscribe(&mut self, subscription: EventSubscription) {
        self.created_subscriptions.push(subscription);
    }

    pub fn remove_subscription(&mut self, id: SubscriptionId) {
        self.deleted_subscriptions.push(id);
    }

    // ── Flush ──

    /// Consume the tree into the atomic change set for the store.
    pub fn delta(self) -> TreeDelta {
        let mut inserted_executions = Vec::new();
        let mut updated_executions = Vec::new();
        for (id, node) in self.nodes {
            if self.inserted.contains(&id) {
                inserted_executions.push(node);
            } else if self.dirty.contains(&id) {
                updated_executions.push(node);
            }
        }
        // Deterministic apply order for backends and tests.
        inserted_executions.sort_by_key(|e| e.id);
        updated_executions.sort_by_key(|e| e.id);
        TreeDelta {
            process_instance_id: self.process_instance_id,
            inserted_executions,
            updated_executions,
            removed_executions: self.removed,
            created_jobs: self.created_jobs,
            updated_jobs: self.updated_jobs,
            deleted_jobs: self.deleted_jobs,
            created_subscriptions: self.created_subscriptions,
            deleted_subscriptions: self.deleted_subscriptions,
        }
    }
}
