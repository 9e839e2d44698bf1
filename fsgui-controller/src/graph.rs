//! The graph controller: owns every node instance, resolves
//! `Ref`/`TriggerTree` parameters into a dependency graph, and drives the
//! post-order build/unbuild lifecycle by talking to each node's worker
//! control channel. Grounded on `bpmn-lite-core::engine::BpmnLiteEngine`'s
//! facade shape (one struct, `anyhow`-free typed errors, async methods) but
//! single-threaded rather than `Arc`-shared: the controller is
//! single-threaded relative to graph mutation.

use crate::launcher::{WorkerChannel, WorkerLauncher};
use crate::validate::validate_and_merge;
use fsgui_core::error::{ConfigurationError, FsguiError, LifecycleError, RuntimeError};
use fsgui_core::transport::{discovery, ControlRequest, ControlResponse, Registry};
use fsgui_core::types::{InstanceId, NodeConfigBlob, NodeInstance, NodeStatus, ParamKind, ParamValues, TriggerTree};
use fsgui_kernels::kernel::KernelRegistry;
use petgraph::graphmap::DiGraphMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// How long `unbuild_node` waits for a worker's `Stopped` acknowledgement
/// after sending `stop` before giving up on a graceful join.
const UNBUILD_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// One resolved reference: the `InboundMap` slot a child's subscriber
/// endpoint must be handed to the parent under, and the child's id.
struct ChildRef {
    slot: String,
    id: InstanceId,
}

struct BuiltWorker {
    channel: Box<dyn WorkerChannel>,
    data_endpoint: String,
    telemetry_endpoint: String,
}

/// Owns the kernel catalog, every node instance, and (for built instances
/// only) a live worker control channel.
pub struct GraphController {
    registry: Arc<KernelRegistry>,
    instances: HashMap<InstanceId, NodeInstance>,
    workers: HashMap<InstanceId, BuiltWorker>,
    /// Edge `parent -> child`: kept in sync with each instance's current
    /// reference-resolved children, used to detect cycles before a build.
    dep_graph: DiGraphMap<InstanceId, ()>,
    launcher: Arc<dyn WorkerLauncher>,
    /// Well-known name -> endpoint for acquisition sources and hardware
    /// services, resolved via discovery and populated once at startup.
    services: Registry,
}

impl GraphController {
    pub fn new(registry: Arc<KernelRegistry>, launcher: Arc<dyn WorkerLauncher>, services: Registry) -> Self {
        Self {
            registry,
            instances: HashMap::new(),
            workers: HashMap::new(),
            dep_graph: DiGraphMap::new(),
            launcher,
            services,
        }
    }

    /// Seed from a loaded configuration file, preserving
    /// instance ids and param blobs exactly, all starting `Unbuilt`.
    pub fn load_instances(&mut self, blobs: Vec<NodeConfigBlob>) {
        for blob in blobs {
            let instance = NodeInstance {
                instance_id: blob.instance_id,
                type_id: blob.type_id,
                nickname: blob.nickname,
                params: blob.params,
                status: NodeStatus::Unbuilt,
            };
            self.dep_graph.add_node(instance.instance_id);
            self.instances.insert(instance.instance_id, instance);
        }
        for id in self.instances.keys().copied().collect::<Vec<_>>() {
            let _ = self.sync_dep_graph(id);
        }
    }

    pub fn available_types(&self) -> Vec<&'static str> {
        self.registry.type_ids().collect()
    }

    pub fn get_configs(&self) -> Vec<&NodeInstance> {
        self.instances.values().collect()
    }

    pub fn create_node(&mut self, type_id: &str, params: ParamValues) -> Result<InstanceId, FsguiError> {
        let kernel = self
            .registry
            .get(type_id)
            .ok_or_else(|| ConfigurationError::UnknownType(type_id.to_string()))?;
        let merged = validate_and_merge(type_id, kernel.schema(), &params)?;

        let id = self.allocate_id();
        let instance = NodeInstance {
            instance_id: id,
            type_id: type_id.to_string(),
            nickname: type_id.to_string(),
            params: merged,
            status: NodeStatus::Unbuilt,
        };
        self.dep_graph.add_node(id);
        self.instances.insert(id, instance);
        self.sync_dep_graph(id)?;
        Ok(id)
    }

    pub fn duplicate_node(&mut self, id: InstanceId) -> Result<InstanceId, FsguiError> {
        let source = self.instances.get(&id).ok_or(LifecycleError::NotFound(id))?.clone();
        let new_id = self.allocate_id();
        let instance = NodeInstance {
            instance_id: new_id,
            type_id: source.type_id,
            nickname: format!("Copy of {}", source.nickname),
            params: source.params,
            status: NodeStatus::Unbuilt,
        };
        self.dep_graph.add_node(new_id);
        self.instances.insert(new_id, instance);
        self.sync_dep_graph(new_id)?;
        Ok(new_id)
    }

    /// Replaces params; never rebuilds. Permissive by design: legal
    /// regardless of build status.
    pub fn edit_node(&mut self, id: InstanceId, params: ParamValues) -> Result<(), FsguiError> {
        let type_id = self
            .instances
            .get(&id)
            .ok_or(LifecycleError::NotFound(id))?
            .type_id
            .clone();
        let kernel = self
            .registry
            .get(&type_id)
            .expect("instance type_id was validated at create_node");
        let merged = validate_and_merge(&type_id, kernel.schema(), &params)?;

        let instance = self.instances.get_mut(&id).expect("checked above");
        instance.params = merged;
        self.sync_dep_graph(id)?;
        Ok(())
    }

    pub fn delete_node(&mut self, id: InstanceId) -> Result<(), FsguiError> {
        let instance = self.instances.get(&id).ok_or(LifecycleError::NotFound(id))?;
        if instance.is_built() {
            return Err(LifecycleError::StillBuilt(id).into());
        }
        self.instances.remove(&id);
        self.dep_graph.remove_node(id);
        Ok(())
    }

    /// Builds every unbuilt child first (post-order DFS over the resolved
    /// reference graph), then builds `id` itself.
    pub async fn build_node(&mut self, id: InstanceId) -> Result<(), FsguiError> {
        let instance = self.instances.get(&id).ok_or(LifecycleError::NotFound(id))?;
        if instance.is_built() {
            return Err(LifecycleError::AlreadyBuilt(id).into());
        }
        let order = self.topological_build_order(id)?;
        for node_id in order {
            if self.instances[&node_id].is_built() {
                continue;
            }
            self.build_one(node_id).await?;
        }
        Ok(())
    }

    /// Release protocol: (1) send `stop`; (2) if the send fails, the worker
    /// is already dead and the stop is silently skipped; (3) join by
    /// draining responses until `Stopped` or the channel closes, bounded by
    /// `UNBUILD_JOIN_TIMEOUT`; (4) drop the handle regardless of whether the
    /// join completed in time.
    pub async fn unbuild_node(&mut self, id: InstanceId) -> Result<(), FsguiError> {
        let instance = self.instances.get(&id).ok_or(LifecycleError::NotFound(id))?;
        if !instance.is_built() {
            return Err(LifecycleError::NotBuilt(id).into());
        }
        for parent in self.dep_graph.neighbors_directed(id, petgraph::Direction::Incoming) {
            if self.instances.get(&parent).is_some_and(|p| p.is_built()) {
                return Err(LifecycleError::DependentStillBuilt { dependent: parent }.into());
            }
        }

        if let Some(worker) = self.workers.get_mut(&id) {
            if worker.channel.send(ControlRequest::Stop).await.is_ok() {
                let _ = tokio::time::timeout(UNBUILD_JOIN_TIMEOUT, async {
                    loop {
                        match worker.channel.recv().await {
                            Some(ControlResponse::Stopped) | None => break,
                            Some(_) => continue,
                        }
                    }
                })
                .await;
            }
        }

        self.workers.remove(&id);
        self.instances.get_mut(&id).unwrap().status = NodeStatus::Unbuilt;
        Ok(())
    }

    /// Attempts to build every instance; per-instance failures are logged
    /// and do not abort the pass.
    pub async fn build_all(&mut self) {
        let ids: Vec<_> = self.instances.keys().copied().collect();
        for id in ids {
            if self.instances[&id].is_built() {
                continue;
            }
            if let Err(err) = self.build_node(id).await {
                tracing::error!(instance = %id, error = %err, "build_all: instance failed to build");
            }
        }
    }

    pub async fn send_message(&mut self, id: InstanceId, request: ControlRequest) -> Result<(), FsguiError> {
        let worker = self.workers.get_mut(&id).ok_or(LifecycleError::NotBuilt(id))?;
        if worker.channel.send(request).await.is_err() {
            self.mark_crashed(id);
            return Err(RuntimeError::ProcessCrashed.into());
        }
        Ok(())
    }

    /// Drains one iteration of every worker's control-channel traffic
    /// without blocking.
    pub fn process_items(&mut self) {
        let mut crashed = Vec::new();
        for (&id, worker) in self.workers.iter_mut() {
            loop {
                match worker.channel.try_recv() {
                    Ok(Some(ControlResponse::Log { level, target, message })) => {
                        tracing::info!(instance = %id, %level, %target, "{message}");
                    }
                    Ok(Some(ControlResponse::Exception { kind, trace, repr })) => {
                        tracing::error!(instance = %id, %kind, %repr, "{trace}");
                    }
                    Ok(Some(ControlResponse::Stopped)) => {
                        tracing::info!(instance = %id, "worker stopped");
                    }
                    Ok(Some(ControlResponse::Endpoints { .. })) => {
                        tracing::warn!(instance = %id, "unexpected endpoints announcement after build");
                    }
                    Ok(None) => break,
                    Err(()) => {
                        crashed.push(id);
                        break;
                    }
                }
            }
        }
        for id in crashed {
            self.mark_crashed(id);
        }
    }

    pub fn get_save_config(&self) -> Vec<NodeConfigBlob> {
        self.instances
            .values()
            .map(|i| NodeConfigBlob {
                type_id: i.type_id.clone(),
                instance_id: i.instance_id,
                nickname: i.nickname.clone(),
                params: i.params.clone(),
            })
            .collect()
    }

    pub fn get_reporters_map(&self) -> HashMap<InstanceId, String> {
        self.workers
            .iter()
            .map(|(&id, w)| (id, w.telemetry_endpoint.clone()))
            .collect()
    }

    pub fn get_node_children_ids(&self, id: InstanceId) -> Result<Vec<InstanceId>, FsguiError> {
        let instance = self.instances.get(&id).ok_or(LifecycleError::NotFound(id))?;
        Ok(self.children_of(instance)?.into_iter().map(|c| c.id).collect())
    }

    /// Every built instance in reverse dependency order (children last),
    /// for a clean shutdown that unbuilds in reverse dependency order.
    pub fn built_in_reverse_dependency_order(&self) -> Vec<InstanceId> {
        let mut order = Vec::new();
        let mut visited = std::collections::HashSet::new();
        for id in self.instances.keys().copied() {
            self.collect_topo(id, &mut visited, &mut order);
        }
        order
            .into_iter()
            .rev()
            .filter(|id| self.instances[id].is_built())
            .collect()
    }

    fn collect_topo(&self, id: InstanceId, visited: &mut std::collections::HashSet<InstanceId>, order: &mut Vec<InstanceId>) {
        if !visited.insert(id) {
            return;
        }
        for child in self.dep_graph.neighbors_directed(id, petgraph::Direction::Outgoing) {
            self.collect_topo(child, visited, order);
        }
        order.push(id);
    }

    fn allocate_id(&self) -> InstanceId {
        loop {
            let id = InstanceId::new();
            if !self.instances.contains_key(&id) {
                return id;
            }
        }
    }

    fn children_of(&self, instance: &NodeInstance) -> Result<Vec<ChildRef>, ConfigurationError> {
        let kernel = self
            .registry
            .get(&instance.type_id)
            .expect("instance type_id was validated at create_node");
        let mut out = Vec::new();
        for desc in kernel.schema() {
            match &desc.kind {
                ParamKind::Ref(_) => {
                    let Some(value) = instance.params.get(&desc.name) else { continue };
                    let Some(target) = InstanceId::from_value(value) else { continue };
                    if !self.instances.contains_key(&target) {
                        return Err(ConfigurationError::UnresolvedReference {
                            param: desc.name.clone(),
                            target,
                        });
                    }
                    out.push(ChildRef { slot: desc.name.clone(), id: target });
                }
                ParamKind::TriggerTree => {
                    let Some(value) = instance.params.get(&desc.name) else { continue };
                    let Some(tree) = TriggerTree::from_value(value) else { continue };
                    for leaf in tree.leaf_ids() {
                        if !self.instances.contains_key(&leaf) {
                            return Err(ConfigurationError::UnresolvedReference {
                                param: desc.name.clone(),
                                target: leaf,
                            });
                        }
                        out.push(ChildRef { slot: leaf.to_string(), id: leaf });
                    }
                }
                _ => {}
            }
        }
        Ok(out)
    }

    fn sync_dep_graph(&mut self, id: InstanceId) -> Result<(), FsguiError> {
        let children: Vec<_> = {
            let instance = self.instances.get(&id).expect("id just inserted/edited");
            match self.children_of(instance) {
                Ok(children) => children.into_iter().map(|c| c.id).collect(),
                // An edit that leaves a dangling reference is allowed
                // (`edit_node` never rebuilds or validates references);
                // the graph simply has no edge there until it resolves.
                Err(_) => Vec::new(),
            }
        };
        let stale: Vec<_> = self
            .dep_graph
            .neighbors_directed(id, petgraph::Direction::Outgoing)
            .collect();
        for child in stale {
            self.dep_graph.remove_edge(id, child);
        }
        for child in children {
            self.dep_graph.add_edge(id, child, ());
        }
        Ok(())
    }

    /// DFS-based topological sort (Tarjan's classic formulation) restricted
    /// to `root` and its transitive children, surfacing a `Cycle` error
    /// with the offending path instead of `petgraph::algo::toposort`'s bare
    /// node id.
    fn topological_build_order(&self, root: InstanceId) -> Result<Vec<InstanceId>, FsguiError> {
        let mut order = Vec::new();
        let mut permanent = std::collections::HashSet::new();
        let mut path = Vec::new();
        self.visit(root, &mut permanent, &mut path, &mut order)?;
        Ok(order)
    }

    fn visit(
        &self,
        id: InstanceId,
        permanent: &mut std::collections::HashSet<InstanceId>,
        path: &mut Vec<InstanceId>,
        order: &mut Vec<InstanceId>,
    ) -> Result<(), FsguiError> {
        if permanent.contains(&id) {
            return Ok(());
        }
        if let Some(pos) = path.iter().position(|&p| p == id) {
            let mut cycle = path[pos..].to_vec();
            cycle.push(id);
            return Err(ConfigurationError::Cycle(cycle).into());
        }
        let instance = self.instances.get(&id).ok_or(LifecycleError::NotFound(id))?;
        path.push(id);
        for child in self.children_of(instance)? {
            self.visit(child.id, permanent, path, order)?;
        }
        path.pop();
        permanent.insert(id);
        order.push(id);
        Ok(())
    }

    /// Spawns the worker for a single already-children-built node,
    /// resolving every inbound/service/acquisition endpoint before
    /// sending `Init`, and wiring each child's fanout (§4.3 "Recursive
    /// build").
    async fn build_one(&mut self, id: InstanceId) -> Result<(), FsguiError> {
        let instance = self.instances.get(&id).expect("caller checked existence");
        let type_id = instance.type_id.clone();
        let params = instance.params.clone();
        let children = self.children_of(instance)?;

        let mut channel = self
            .launcher
            .spawn(&type_id, id)
            .await
            .map_err(|e| fsgui_core::error::BuildError { message: e.to_string() })?;

        let (data_endpoint, telemetry_endpoint) = match channel.recv().await {
            Some(ControlResponse::Endpoints { data, telemetry }) => (data, telemetry),
            Some(ControlResponse::Exception { kind, trace, repr }) => {
                self.instances.get_mut(&id).unwrap().status = NodeStatus::Error(repr.clone());
                return Err(fsgui_core::error::BuildError { message: format!("{kind}: {trace}") }.into());
            }
            _ => {
                self.instances.get_mut(&id).unwrap().status = NodeStatus::Error("Process crashed.".to_string());
                return Err(RuntimeError::ProcessCrashed.into());
            }
        };

        let mut inbound = std::collections::BTreeMap::new();
        for child in &children {
            let child_endpoint = self.workers[&child.id].data_endpoint.clone();
            if self
                .workers
                .get_mut(&child.id)
                .unwrap()
                .channel
                .send(ControlRequest::AddFanoutSubscriber { endpoint: child_endpoint.clone() })
                .await
                .is_err()
            {
                self.mark_crashed(child.id);
                return Err(RuntimeError::ProcessCrashed.into());
            }
            inbound.insert(child.slot.clone(), child_endpoint);
        }

        let mut services = std::collections::BTreeMap::new();
        for name in [discovery::TRODES_HARDWARE, discovery::STATESCRIPT_SERVICE] {
            if let Ok(endpoint) = self.services.resolve(name, 0) {
                services.insert(name.to_string(), endpoint);
            }
        }
        let acquisition_endpoint = match type_id.as_str() {
            discovery::SOURCE_LFP | discovery::SOURCE_WAVEFORMS | discovery::SOURCE_POSITION => {
                self.services.resolve(&type_id, 0).ok()
            }
            _ => None,
        };

        if channel
            .send(ControlRequest::Init { params, inbound, services, acquisition_endpoint })
            .await
            .is_err()
        {
            self.instances.get_mut(&id).unwrap().status = NodeStatus::Error("Process crashed.".to_string());
            return Err(RuntimeError::ProcessCrashed.into());
        }

        self.workers.insert(id, BuiltWorker { channel, data_endpoint, telemetry_endpoint });
        self.instances.get_mut(&id).unwrap().status = NodeStatus::Built;
        Ok(())
    }

    fn mark_crashed(&mut self, id: InstanceId) {
        self.workers.remove(&id);
        if let Some(instance) = self.instances.get_mut(&id) {
            instance.status = NodeStatus::Error("Process crashed.".to_string());
        }
    }
}
