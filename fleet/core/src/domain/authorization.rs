// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::error::FleetError;
use crate::domain::resource::ResourceId;

/// Identity on whose behalf an inventory operation runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Caller {
    /// Internal system identity; bypasses authorization.
    Overlord,
    User { name: String, inventory_manager: bool },
}

impl Caller {
    pub fn user(name: impl Into<String>, inventory_manager: bool) -> Self {
        Self::User {
            name: name.into(),
            inventory_manager,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Overlord => "overlord",
            Self::User { name, .. } => name,
        }
    }
}

#[async_trait]
pub trait AuthorizationService: Send + Sync {
    async fn can_manage_inventory(&self, caller: &Caller, resource: ResourceId) -> Result<bool, FleetError>;
}

/// Grants inventory management to the overlord and to users flagged as
/// inventory managers.
#[derive(Debug, Clone, Default)]
pub struct InventoryRoleAuthorization;

#[async_trait]
impl AuthorizationService for InventoryRoleAuthorization {
    async fn can_manage_inventory(&self, caller: &Caller, _resource: ResourceId) -> Result<bool, FleetError> {
        Ok(match caller {
            Caller::Overlord => true,
            Caller::User { inventory_manager, .. } => *inventory_manager,
        })
    }
}

/// Fail with `FleetError::Permission` unless `caller` may manage `resource`.
pub async fn ensure_can_manage(
    authz: &dyn AuthorizationService,
    caller: &Caller,
    resource: ResourceId,
) -> Result<(), FleetError> {
    if authz.can_manage_inventory(caller, resource).await? {
        Ok(())
    } else {
        Err(FleetError::Permission(format!(
            "user [{}] may not manage inventory of resource [{}]",
            caller.name(),
            resource
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inventory_role_authorization() {
        let authz = InventoryRoleAuthorization;
        assert!(ensure_can_manage(&authz, &Caller::Overlord, ResourceId(1)).await.is_ok());
        assert!(ensure_can_manage(&authz, &Caller::user("ops", true), ResourceId(1)).await.is_ok());

        let err = ensure_can_manage(&authz, &Caller::user("guest", false), ResourceId(1))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::Permission(_)));
    }
}
