use etcd_client::{Client, Compare, CompareOp, GetOptions, PutOptions, Txn, TxnOp};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::{OperatorError, Result};

/// Kinds of objects kept in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Pod,
    Job,
    CronJob,
    VolumeClaim,
    ConfigMap,
    Secret,
}

impl ObjectKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            ObjectKind::Pod => "/registry/pods/",
            ObjectKind::Job => "/registry/jobs/",
            ObjectKind::CronJob => "/registry/cronjobs/",
            ObjectKind::VolumeClaim => "/registry/persistentvolumeclaims/",
            ObjectKind::ConfigMap => "/registry/configmaps/",
            ObjectKind::Secret => "/registry/secrets/",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Pod => "pod",
            ObjectKind::Job => "job",
            ObjectKind::CronJob => "cronjob",
            ObjectKind::VolumeClaim => "persistent volume claim",
            ObjectKind::ConfigMap => "config map",
            ObjectKind::Secret => "secret",
        }
    }

    pub fn key(&self, name: &str) -> String {
        format!("{}{name}", self.prefix())
    }
}

/// like etcd, k:/registry/<kind>/<name> v:yaml file of the object
///
/// Every call works on its own clone of the client; clones share one channel.
#[derive(Clone)]
pub struct ObjectStore {
    client: Client,
}

impl ObjectStore {
    pub async fn new(endpoints: &[&str]) -> Result<Self> {
        let client = Client::connect(endpoints, None).await?;
        Ok(Self { client })
    }

    /// Write the object only if no object of that name exists yet.
    pub async fn create<T: Serialize>(&self, kind: ObjectKind, name: &str, object: &T) -> Result<()> {
        let key = kind.key(name);
        let yaml = serde_yaml::to_string(object)?;
        let txn = Txn::new()
            .when([Compare::version(key.clone(), CompareOp::Equal, 0)])
            .and_then([TxnOp::put(key, yaml, Some(PutOptions::new()))]);

        let mut client = self.client.clone();
        let resp = client.txn(txn).await?;
        if !resp.succeeded() {
            return Err(OperatorError::AlreadyExists {
                kind: kind.as_str(),
                name: name.to_string(),
            });
        }
        Ok(())
    }

    pub async fn get<T: DeserializeOwned>(&self, kind: ObjectKind, name: &str) -> Result<Option<T>> {
        let key = kind.key(name);
        let mut client = self.client.clone();
        let resp = client.get(key, None).await?;
        match resp.kvs().first() {
            Some(kv) => Ok(Some(serde_yaml::from_slice(kv.value())?)),
            None => Ok(None),
        }
    }

    pub async fn exists(&self, kind: ObjectKind, name: &str) -> Result<bool> {
        let key = kind.key(name);
        let mut client = self.client.clone();
        let resp = client
            .get(key, Some(GetOptions::new().with_keys_only()))
            .await?;
        Ok(!resp.kvs().is_empty())
    }

    /// Delete an object, failing with `NotFound` if there was nothing to delete.
    pub async fn delete(&self, kind: ObjectKind, name: &str) -> Result<()> {
        let key = kind.key(name);
        let mut client = self.client.clone();
        let resp = client.delete(key, None).await?;
        if resp.deleted() == 0 {
            return Err(OperatorError::not_found(kind.as_str(), name));
        }
        Ok(())
    }

    pub async fn list_names(&self, kind: ObjectKind) -> Result<Vec<String>> {
        let mut client = self.client.clone();
        let resp = client
            .get(
                kind.prefix(),
                Some(GetOptions::new().with_prefix().with_keys_only()),
            )
            .await?;
        Ok(resp
            .kvs()
            .iter()
            .map(|kv| String::from_utf8_lossy(kv.key()).replace(kind.prefix(), ""))
            .collect())
    }
}
