//! Session mirror
//!
//! Typed access to the `sess:<uuid>` hash that the authentication server
//! creates. Accounting enriches it on Start and Interim and removes it on
//! Stop, together with the subscriber's index entry.

use crate::store::{Store, StoreError};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

/// Decoded session hash
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Session {
    pub imsi: String,
    /// Epoch seconds
    pub start_time: i64,
    pub nas_ip: String,
    pub client_ip: String,
    pub acct_id: String,
    pub input_octets: i64,
    pub output_octets: i64,
}

impl Session {
    /// Decode the flat hash
    ///
    /// Absent fields decode as empty/zero. A numeric field that is present
    /// but not an integer fails with `StoreError::Malformed`.
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, StoreError> {
        let text = |name: &str| fields.get(name).cloned().unwrap_or_default();
        let number = |name: &'static str| -> Result<i64, StoreError> {
            match fields.get(name).map(|v| v.trim()) {
                None | Some("") => Ok(0),
                Some(value) => value.parse().map_err(|_| StoreError::Malformed {
                    field: name,
                    value: value.to_string(),
                }),
            }
        };

        Ok(Session {
            imsi: text("imsi"),
            start_time: number("start_time")?,
            nas_ip: text("nas_ip"),
            client_ip: text("client_ip"),
            acct_id: text("acct_id"),
            input_octets: number("input_octets")?,
            output_octets: number("output_octets")?,
        })
    }
}

/// Fields written on Accounting Start
#[derive(Debug, Clone)]
pub struct StartUpdate {
    pub start_time: i64,
    pub nas_ip: IpAddr,
    pub acct_id: String,
    pub client_ip: Option<Ipv4Addr>,
}

impl StartUpdate {
    fn fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("start_time", self.start_time.to_string()),
            ("nas_ip", self.nas_ip.to_string()),
            ("acct_id", self.acct_id.clone()),
        ];
        if let Some(ip) = self.client_ip {
            fields.push(("client_ip", ip.to_string()));
        }
        fields
    }
}

/// Fields written on Interim-Update
#[derive(Debug, Clone)]
pub struct InterimUpdate {
    pub nas_ip: IpAddr,
    pub client_ip: Option<Ipv4Addr>,
    pub input_octets: u32,
    pub output_octets: u32,
}

impl InterimUpdate {
    fn fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![("nas_ip", self.nas_ip.to_string())];
        if let Some(ip) = self.client_ip {
            fields.push(("client_ip", ip.to_string()));
        }
        fields.push(("input_octets", self.input_octets.to_string()));
        fields.push(("output_octets", self.output_octets.to_string()));
        fields
    }
}

/// Session operations over the store gateway
#[derive(Clone)]
pub struct SessionMirror {
    store: Arc<dyn Store>,
}

impl SessionMirror {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn exists(&self, uuid: &str) -> Result<bool, StoreError> {
        self.store.session_exists(uuid).await
    }

    /// Read and decode a session; `StoreError::NotFound` when absent
    pub async fn get(&self, uuid: &str) -> Result<Session, StoreError> {
        let fields = self.store.session_get(uuid).await?;
        Session::from_fields(&fields)
    }

    pub async fn update_on_start(&self, uuid: &str, update: &StartUpdate) -> Result<(), StoreError> {
        self.store.session_merge(uuid, &update.fields()).await
    }

    pub async fn update_on_interim(
        &self,
        uuid: &str,
        update: &InterimUpdate,
    ) -> Result<(), StoreError> {
        self.store.session_merge(uuid, &update.fields()).await
    }

    pub async fn delete(&self, uuid: &str) -> Result<(), StoreError> {
        self.store.session_delete(uuid).await
    }

    pub async fn remove_user_index(&self, imsi: &str, uuid: &str) -> Result<(), StoreError> {
        self.store.user_index_remove(imsi, uuid).await
    }
}
