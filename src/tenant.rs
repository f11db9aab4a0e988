//! Tenant registry — the isolation boundary every other component
//! depends on.
//!
//! A mutex-guarded list plus a JSON snapshot on disk, with `delete_tenant`
//! cascading across every reverse-index map that references a tenant.
//! A Tenant here also carries the persona fields the Generator consumes
//! (§9), and deletion additionally has to reach the vector/lexical
//! indices and job store, which the orchestrator's caller is responsible
//! for wiring (see
//! `Orchestrator::delete_tenant`).

use crate::config::TenantPersona;
use crate::types::TenantId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub tenant_id: TenantId,
    pub name: String,
    pub persona: TenantPersona,
    pub created_at: DateTime<Utc>,
}

pub struct TenantRegistry {
    tenants: Mutex<Vec<Tenant>>,
    data_dir: PathBuf,
}

impl TenantRegistry {
    pub fn new(data_dir: PathBuf) -> Self {
        let tenants = Self::load(&data_dir).unwrap_or_default();
        Self {
            tenants: Mutex::new(tenants),
            data_dir,
        }
    }

    fn load(data_dir: &PathBuf) -> Result<Vec<Tenant>, std::io::Error> {
        let path = data_dir.join("tenants.json");
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = fs::read_to_string(path)?;
        serde_json::from_str(&data).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    fn save(&self) -> Result<(), String> {
        let tenants = self.tenants.lock().map_err(|e| e.to_string())?;
        fs::create_dir_all(&self.data_dir).map_err(|e| format!("failed to create data dir: {e}"))?;
        let json = serde_json::to_string_pretty(&*tenants).map_err(|e| e.to_string())?;
        fs::write(self.data_dir.join("tenants.json"), json).map_err(|e| e.to_string())
    }

    pub fn create_tenant(&self, tenant_id: impl Into<String>, name: impl Into<String>, persona: TenantPersona) -> Result<Tenant, String> {
        let tenant_id = tenant_id.into();
        let mut tenants = self.tenants.lock().map_err(|e| e.to_string())?;
        if tenants.iter().any(|t| t.tenant_id == tenant_id) {
            return Err(format!("tenant '{tenant_id}' already exists"));
        }
        let tenant = Tenant {
            tenant_id,
            name: name.into(),
            persona,
            created_at: Utc::now(),
        };
        tenants.push(tenant.clone());
        drop(tenants);
        self.save()?;
        Ok(tenant)
    }

    pub fn get(&self, tenant_id: &str) -> Option<Tenant> {
        self.tenants.lock().ok()?.iter().find(|t| t.tenant_id == tenant_id).cloned()
    }

    pub fn exists(&self, tenant_id: &str) -> bool {
        self.tenants
            .lock()
            .map(|t| t.iter().any(|t| t.tenant_id == tenant_id))
            .unwrap_or(false)
    }

    pub fn list(&self) -> Vec<Tenant> {
        self.tenants.lock().map(|t| t.clone()).unwrap_or_default()
    }

    /// Remove the tenant record itself. Cascading deletion of documents,
    /// chunks, embeddings, sessions, messages and jobs is the caller's
    /// responsibility (§3 "deleting a tenant deletes all transitively
    /// owned data") because those live in other components this registry
    /// does not own.
    pub fn delete_tenant(&self, tenant_id: &str) -> Result<(), String> {
        let mut tenants = self.tenants.lock().map_err(|e| e.to_string())?;
        let index = tenants
            .iter()
            .position(|t| t.tenant_id == tenant_id)
            .ok_or_else(|| "tenant not found".to_string())?;
        tenants.remove(index);
        drop(tenants);
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_delete_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let registry = TenantRegistry::new(dir.path().to_path_buf());
        registry
            .create_tenant("t1", "Acme", TenantPersona::default())
            .unwrap();
        assert!(registry.exists("t1"));
        registry.delete_tenant("t1").unwrap();
        assert!(!registry.exists("t1"));
    }

    #[test]
    fn duplicate_tenant_id_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let registry = TenantRegistry::new(dir.path().to_path_buf());
        registry.create_tenant("t1", "Acme", TenantPersona::default()).unwrap();
        assert!(registry.create_tenant("t1", "Acme2", TenantPersona::default()).is_err());
    }
}
