//! SimulatedCloud: an in-process stand-in for the managed Kubernetes platform
//!
//! Serves `cluster`, `node_pool`, `project_resources` and `namespace` with the
//! same validation a real control API applies (regions, live references, the
//! credentials a namespace is created with). The world can be persisted to a
//! JSON file so separate CLI runs see the same cloud.
//!
//! For tests it records every call, tracks how many calls overlap, and
//! injects faults per call kind and address.

use crate::error::{ProviderError, ProviderResult};
use crate::provider::{LiveResource, Provider, ResourceRequest};
use crate::schemas::{cloud_schemas, REGIONS};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use clusterform_core::{Attributes, ResourceAddress, SchemaSet};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    Create,
    Read,
    Update,
    Delete,
    Find,
}

/// One recorded provider call.
#[derive(Clone, Debug, PartialEq)]
pub struct ProviderCall {
    pub call: CallKind,
    pub resource_type: String,
    pub address: Option<ResourceAddress>,
    pub id: Option<String>,
}

/// Fail matching calls with `error`, `times` times (forever when `None`).
#[derive(Clone, Debug)]
pub struct FaultRule {
    pub call: Option<CallKind>,
    pub address: Option<ResourceAddress>,
    pub error: ProviderError,
    pub times: Option<u32>,
}

impl FaultRule {
    pub fn on(call: CallKind, address: ResourceAddress, error: ProviderError) -> Self {
        Self {
            call: Some(call),
            address: Some(address),
            error,
            times: None,
        }
    }

    /// Matches every call of every kind.
    pub fn always(error: ProviderError) -> Self {
        Self {
            call: None,
            address: None,
            error,
            times: None,
        }
    }

    pub fn times(mut self, n: u32) -> Self {
        self.times = Some(n);
        self
    }

    fn matches(&self, call: CallKind, address: Option<&ResourceAddress>) -> bool {
        if self.times == Some(0) {
            return false;
        }
        let call_ok = self.call.map(|c| c == call).unwrap_or(true);
        let addr_ok = match (&self.address, address) {
            (None, _) => true,
            (Some(want), Some(got)) => want == got,
            (Some(_), None) => false,
        };
        call_ok && addr_ok
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct SimObject {
    kind: String,
    address: ResourceAddress,
    id: String,
    /// World serial at creation.
    #[serde(default)]
    serial: u64,
    attributes: Attributes,
}

impl SimObject {
    fn live(&self) -> LiveResource {
        LiveResource {
            id: self.id.clone(),
            attributes: self.attributes.clone(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct World {
    serial: u64,
    /// Keyed by `kind/id`.
    objects: BTreeMap<String, SimObject>,
}

impl World {
    fn key(kind: &str, id: &str) -> String {
        format!("{kind}/{id}")
    }

    fn of_kind<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a SimObject> + 'a {
        self.objects.values().filter(move |o| o.kind == kind)
    }
}

pub struct SimulatedCloud {
    schemas: SchemaSet,
    world: Mutex<World>,
    faults: Mutex<Vec<FaultRule>>,
    calls: Mutex<Vec<ProviderCall>>,
    persist: Option<PathBuf>,
    latency: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for SimulatedCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedCloud {
    pub fn new() -> Self {
        Self {
            schemas: cloud_schemas(),
            world: Mutex::new(World::default()),
            faults: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            persist: None,
            latency: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Open (or start) a cloud persisted at `path`.
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let world = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => World::default(),
            Err(e) => return Err(e),
        };
        Ok(Self {
            world: Mutex::new(world),
            persist: Some(path),
            ..Self::new()
        })
    }

    /// Every call sleeps this long, so concurrent calls overlap.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub async fn inject(&self, rule: FaultRule) {
        self.faults.lock().await.push(rule);
    }

    pub async fn clear_faults(&self) {
        self.faults.lock().await.clear();
    }

    pub async fn calls(&self) -> Vec<ProviderCall> {
        self.calls.lock().await.clone()
    }

    /// Number of mutating calls (create, update, delete).
    pub async fn mutation_count(&self) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|c| matches!(c.call, CallKind::Create | CallKind::Update | CallKind::Delete))
            .count()
    }

    /// Highest number of calls observed in flight at once.
    pub fn max_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Live objects of one kind.
    pub async fn objects(&self, kind: &str) -> Vec<LiveResource> {
        self.world.lock().await.of_kind(kind).map(SimObject::live).collect()
    }

    /// Change an attribute behind the orchestrator's back.
    pub async fn tamper(&self, address: &ResourceAddress, attribute: &str, value: Value) -> bool {
        let mut world = self.world.lock().await;
        let Some(obj) = world.objects.values_mut().find(|o| &o.address == address) else {
            return false;
        };
        obj.attributes.insert(attribute.to_string(), value);
        drop(world);
        self.save().await.is_ok()
    }

    /// Delete an object behind the orchestrator's back.
    pub async fn evict(&self, address: &ResourceAddress) -> bool {
        let mut world = self.world.lock().await;
        let key = world
            .objects
            .iter()
            .find(|(_, o)| &o.address == address)
            .map(|(k, _)| k.clone());
        let removed = key.and_then(|k| world.objects.remove(&k)).is_some();
        drop(world);
        removed && self.save().await.is_ok()
    }

    async fn begin(&self, call: ProviderCall) -> ProviderResult<()> {
        let fault = {
            let mut faults = self.faults.lock().await;
            faults
                .iter_mut()
                .find(|f| f.matches(call.call, call.address.as_ref()))
                .map(|f| {
                    if let Some(n) = f.times.as_mut() {
                        *n -= 1;
                    }
                    f.error.clone()
                })
        };
        debug!(call = ?call.call, kind = %call.resource_type, faulted = fault.is_some(), "provider call");
        self.calls.lock().await.push(call);

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match fault {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn save(&self) -> ProviderResult<()> {
        let Some(path) = &self.persist else {
            return Ok(());
        };
        let world = self.world.lock().await;
        let text = serde_json::to_string_pretty(&*world)
            .map_err(|e| ProviderError::Unavailable(format!("persist: {e}")))?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ProviderError::Unavailable(format!("persist: {e}")))?;
        }
        tokio::fs::write(path, text)
            .await
            .map_err(|e| ProviderError::Unavailable(format!("persist: {e}")))
    }

    fn validate(&self, request: &ResourceRequest, world: &World) -> ProviderResult<()> {
        let kind = request.kind();
        let schema = self
            .schemas
            .get(kind)
            .ok_or_else(|| ProviderError::UnsupportedType(kind.to_string()))?;
        for name in schema.required() {
            if request.attributes.get(name).map(Value::is_null).unwrap_or(true) {
                return Err(ProviderError::invalid(name, "required attribute missing"));
            }
        }
        if let Some(name) = request.attributes.keys().find(|n| !schema.is_argument(n)) {
            return Err(ProviderError::invalid(name, "not an argument of this resource type"));
        }

        let attr = |name: &str| request.attributes.get(name).cloned().unwrap_or(Value::Null);
        match kind {
            "cluster" => {
                let region = attr("region");
                let region = region.as_str().unwrap_or_default();
                if !REGIONS.contains(&region) {
                    return Err(ProviderError::invalid("region", format!("unknown region '{region}'")));
                }
                if let Some(pool) = request.attributes.get("node_pool") {
                    let count = pool.get("node_count").and_then(Value::as_u64).unwrap_or(0);
                    if count == 0 {
                        return Err(ProviderError::invalid("node_pool", "node_count must be at least 1"));
                    }
                }
            }
            "node_pool" => {
                let cluster_id = attr("cluster_id");
                let cluster_id = cluster_id.as_str().unwrap_or_default();
                if !world.objects.contains_key(&World::key("cluster", cluster_id)) {
                    return Err(ProviderError::invalid(
                        "cluster_id",
                        format!("no cluster with id '{cluster_id}'"),
                    ));
                }
                if attr("node_count").as_u64().unwrap_or(0) == 0 {
                    return Err(ProviderError::invalid("node_count", "must be at least 1"));
                }
            }
            "project_resources" => {
                let urns = attr("resources");
                let urns = urns
                    .as_array()
                    .ok_or_else(|| ProviderError::invalid("resources", "expected a list of URNs"))?;
                for urn in urns {
                    let urn = urn.as_str().unwrap_or_default();
                    let known = world
                        .objects
                        .values()
                        .any(|o| o.attributes.get("urn").and_then(Value::as_str) == Some(urn));
                    if !known {
                        return Err(ProviderError::invalid("resources", format!("unknown URN '{urn}'")));
                    }
                }
            }
            "namespace" => {
                let host = attr("host");
                let host = host.as_str().unwrap_or_default();
                let cluster = world
                    .of_kind("cluster")
                    .find(|c| c.attributes.get("endpoint").and_then(Value::as_str) == Some(host))
                    .ok_or_else(|| {
                        ProviderError::invalid("host", format!("no cluster serves '{host}'"))
                    })?;
                let expected = cluster
                    .attributes
                    .get("kube_config")
                    .and_then(|k| k.get(0))
                    .and_then(|k| k.get("token"))
                    .and_then(Value::as_str);
                if attr("token").as_str() != expected {
                    return Err(ProviderError::Unauthorized(format!(
                        "token rejected by {host}"
                    )));
                }
                let ca = attr("cluster_ca_certificate");
                if !ca
                    .as_str()
                    .unwrap_or_default()
                    .starts_with("-----BEGIN CERTIFICATE-----")
                {
                    return Err(ProviderError::invalid(
                        "cluster_ca_certificate",
                        "expected a PEM certificate",
                    ));
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn materialize(
        &self,
        request: &ResourceRequest,
        id: &str,
        serial: u64,
        prior: Option<&SimObject>,
    ) -> Attributes {
        let mut attrs = request.attributes.clone();
        let keep = |name: &str| prior.and_then(|p| p.attributes.get(name).cloned());
        attrs.insert("id".into(), json!(id));

        match request.kind() {
            "cluster" => {
                let endpoint = keep("endpoint")
                    .unwrap_or_else(|| json!(format!("https://{id}.k8s.sim.cloud")));
                let kube_config = keep("kube_config").unwrap_or_else(|| {
                    let pem = format!(
                        "-----BEGIN CERTIFICATE-----\nsim-ca-{id}\n-----END CERTIFICATE-----\n"
                    );
                    json!([{
                        "host": endpoint,
                        "token": format!("sim-{}", uuid::Uuid::new_v4().simple()),
                        "cluster_ca_certificate": STANDARD.encode(pem),
                    }])
                });
                attrs.insert("urn".into(), json!(format!("do:kubernetes:{id}")));
                attrs.insert("endpoint".into(), endpoint);
                attrs.insert(
                    "ipv4_address".into(),
                    keep("ipv4_address")
                        .unwrap_or_else(|| json!(format!("10.{}.0.1", serial % 250))),
                );
                attrs.insert("status".into(), json!("running"));
                attrs.insert(
                    "created_at".into(),
                    keep("created_at").unwrap_or_else(|| json!(Utc::now().to_rfc3339())),
                );
                attrs.insert("kube_config".into(), kube_config);
            }
            "node_pool" => {
                let name = request
                    .attributes
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("pool");
                let count = request
                    .attributes
                    .get("node_count")
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                let nodes: Vec<Value> = (0..count)
                    .map(|i| json!({"name": format!("{name}-{i}"), "status": "running"}))
                    .collect();
                attrs.insert("nodes".into(), Value::Array(nodes));
            }
            "namespace" => {
                attrs.insert(
                    "uid".into(),
                    keep("uid").unwrap_or_else(|| json!(uuid::Uuid::new_v4().to_string())),
                );
            }
            _ => {}
        }
        attrs
    }
}

#[async_trait::async_trait]
impl Provider for SimulatedCloud {
    fn name(&self) -> &str {
        "simulated"
    }

    fn schemas(&self) -> &SchemaSet {
        &self.schemas
    }

    async fn create(&self, request: &ResourceRequest) -> ProviderResult<LiveResource> {
        self.begin(ProviderCall {
            call: CallKind::Create,
            resource_type: request.kind().to_string(),
            address: Some(request.address.clone()),
            id: None,
        })
        .await?;

        let live = {
            let mut world = self.world.lock().await;
            self.validate(request, &world)?;
            world.serial += 1;
            let serial = world.serial;
            if request.kind() == "namespace" {
                let same = |o: &&SimObject| {
                    ["host", "name"]
                        .iter()
                        .all(|a| o.attributes.get(*a) == request.attributes.get(*a))
                };
                if world.of_kind("namespace").any(|o| same(&o)) {
                    return Err(ProviderError::invalid("name", "namespace already exists"));
                }
            }
            let id = uuid::Uuid::new_v4().to_string();
            let key = World::key(request.kind(), &id);
            let obj = SimObject {
                kind: request.kind().to_string(),
                address: request.address.clone(),
                id: id.clone(),
                serial,
                attributes: self.materialize(request, &id, serial, None),
            };
            let live = obj.live();
            world.objects.insert(key, obj);
            live
        };
        self.save().await?;
        Ok(live)
    }

    async fn read(&self, kind: &str, id: &str) -> ProviderResult<Option<LiveResource>> {
        self.begin(ProviderCall {
            call: CallKind::Read,
            resource_type: kind.to_string(),
            address: None,
            id: Some(id.to_string()),
        })
        .await?;
        let world = self.world.lock().await;
        Ok(world.objects.get(&World::key(kind, id)).map(SimObject::live))
    }

    async fn update(&self, id: &str, request: &ResourceRequest) -> ProviderResult<LiveResource> {
        self.begin(ProviderCall {
            call: CallKind::Update,
            resource_type: request.kind().to_string(),
            address: Some(request.address.clone()),
            id: Some(id.to_string()),
        })
        .await?;

        let live = {
            let mut world = self.world.lock().await;
            let key = World::key(request.kind(), id);
            let prior = world
                .objects
                .get(&key)
                .cloned()
                .ok_or_else(|| ProviderError::NotFound(key.clone()))?;
            self.validate(request, &world)?;
            if let Some(schema) = self.schemas.get(request.kind()) {
                for (name, attr) in schema.arguments() {
                    if attr.force_new && prior.attributes.get(name) != request.attributes.get(name)
                    {
                        return Err(ProviderError::invalid(name, "cannot be changed in place"));
                    }
                }
            }
            world.serial += 1;
            let serial = world.serial;
            let obj = SimObject {
                attributes: self.materialize(request, id, serial, Some(&prior)),
                ..prior
            };
            let live = obj.live();
            world.objects.insert(key, obj);
            live
        };
        self.save().await?;
        Ok(live)
    }

    async fn delete(&self, kind: &str, id: &str) -> ProviderResult<()> {
        self.begin(ProviderCall {
            call: CallKind::Delete,
            resource_type: kind.to_string(),
            address: None,
            id: Some(id.to_string()),
        })
        .await?;
        let key = World::key(kind, id);
        let removed = self.world.lock().await.objects.remove(&key);
        if removed.is_none() {
            return Err(ProviderError::NotFound(key));
        }
        self.save().await
    }

    async fn find(&self, address: &ResourceAddress) -> ProviderResult<Option<LiveResource>> {
        self.begin(ProviderCall {
            call: CallKind::Find,
            resource_type: address.kind.clone(),
            address: Some(address.clone()),
            id: None,
        })
        .await?;
        let world = self.world.lock().await;
        Ok(world
            .of_kind(&address.kind)
            .filter(|o| &o.address == address)
            .max_by_key(|o| o.serial)
            .map(SimObject::live))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster_request(key: &str) -> ResourceRequest {
        let mut attrs = Attributes::new();
        attrs.insert("name".into(), json!(format!("k8s-{key}")));
        attrs.insert("region".into(), json!(key));
        attrs.insert("version".into(), json!("1.29"));
        ResourceRequest::new(ResourceAddress::keyed("cluster", "main", key), attrs)
    }

    #[tokio::test]
    async fn create_cluster_computes_credentials() {
        let cloud = SimulatedCloud::new();
        let live = cloud.create(&cluster_request("ams3")).await.unwrap();
        assert_eq!(live.attributes["status"], json!("running"));
        let endpoint = live.attributes["endpoint"].as_str().unwrap();
        assert!(endpoint.starts_with("https://"));
        let kc = &live.attributes["kube_config"][0];
        assert_eq!(kc["host"], json!(endpoint));
        let pem = STANDARD
            .decode(kc["cluster_ca_certificate"].as_str().unwrap())
            .unwrap();
        assert!(String::from_utf8(pem).unwrap().starts_with("-----BEGIN CERTIFICATE-----"));
    }

    #[tokio::test]
    async fn unknown_region_is_permanent_error() {
        let cloud = SimulatedCloud::new();
        let err = cloud.create(&cluster_request("mars1")).await.unwrap_err();
        assert!(matches!(err, ProviderError::InvalidAttribute { .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn update_rejects_force_new_change() {
        let cloud = SimulatedCloud::new();
        let live = cloud.create(&cluster_request("ams3")).await.unwrap();
        let mut moved = cluster_request("nyc1");
        moved.address = ResourceAddress::keyed("cluster", "main", "ams3");
        let err = cloud.update(&live.id, &moved).await.unwrap_err();
        assert!(matches!(err, ProviderError::InvalidAttribute { attribute, .. } if attribute == "region"));
    }

    #[tokio::test]
    async fn update_keeps_identity_and_credentials() {
        let cloud = SimulatedCloud::new();
        let live = cloud.create(&cluster_request("ams3")).await.unwrap();
        let mut req = cluster_request("ams3");
        req.attributes.insert("version".into(), json!("1.30"));
        let updated = cloud.update(&live.id, &req).await.unwrap();
        assert_eq!(updated.id, live.id);
        assert_eq!(updated.attributes["version"], json!("1.30"));
        assert_eq!(updated.attributes["kube_config"], live.attributes["kube_config"]);
    }

    #[tokio::test]
    async fn fault_rule_fires_limited_times() {
        let cloud = SimulatedCloud::new();
        let addr = ResourceAddress::keyed("cluster", "main", "ams3");
        cloud
            .inject(
                FaultRule::on(CallKind::Create, addr, ProviderError::Network("reset".into()))
                    .times(1),
            )
            .await;
        assert!(cloud.create(&cluster_request("ams3")).await.is_err());
        assert!(cloud.create(&cluster_request("ams3")).await.is_ok());
        assert_eq!(cloud.calls().await.len(), 2);
    }

    #[tokio::test]
    async fn find_by_address_and_evict() {
        let cloud = SimulatedCloud::new();
        let req = cluster_request("nyc1");
        let live = cloud.create(&req).await.unwrap();
        let found = cloud.find(&req.address).await.unwrap().unwrap();
        assert_eq!(found.id, live.id);
        assert!(cloud.evict(&req.address).await);
        assert!(cloud.read("cluster", &live.id).await.unwrap().is_none());
        assert!(matches!(
            cloud.delete("cluster", &live.id).await,
            Err(ProviderError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn persisted_world_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cloud.json");
        let id = {
            let cloud = SimulatedCloud::open(&path).unwrap();
            cloud.create(&cluster_request("ams3")).await.unwrap().id
        };
        let cloud = SimulatedCloud::open(&path).unwrap();
        assert!(cloud.read("cluster", &id).await.unwrap().is_some());
    }
}
