// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Expansion of subscribe requests into authorized filter sets.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::auth::{Access, Dimension, Principal};
use crate::backend::{EntityQuery, ListCriteria};
use crate::error::{Error, Result, ValidationError};
use crate::model::{DeviceInfo, EventKind};

use super::Filter;

/// Raw scoping parameters of a subscribe request.
///
/// # Examples
///
/// ```
/// use hivebus::filter::SubscribeParams;
///
/// let params = SubscribeParams::new()
///     .networks([5, 6])
///     .names(["temp"]);
/// assert!(params.device_id.is_none());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeParams {
    /// A single device.
    pub device_id: Option<String>,
    /// Explicit networks.
    pub network_ids: Option<BTreeSet<i64>>,
    /// Explicit device types.
    pub device_type_ids: Option<BTreeSet<i64>>,
    /// Sub-topics; absent means every name.
    pub names: Option<BTreeSet<String>>,
}

impl SubscribeParams {
    /// Creates empty parameters (everything the caller may see).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scopes the request to one device.
    #[must_use]
    pub fn device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    /// Scopes the request to these networks.
    #[must_use]
    pub fn networks(mut self, ids: impl IntoIterator<Item = i64>) -> Self {
        self.network_ids = Some(ids.into_iter().collect());
        self
    }

    /// Scopes the request to these device types.
    #[must_use]
    pub fn device_types(mut self, ids: impl IntoIterator<Item = i64>) -> Self {
        self.device_type_ids = Some(ids.into_iter().collect());
        self
    }

    /// Restricts the request to these sub-topics.
    #[must_use]
    pub fn names<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.names = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Rejects malformed parameters before anything is looked up.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] for an empty `names` set, a blank name
    /// or a blank device id.
    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        if let Some(names) = &self.names {
            if names.is_empty() {
                return Err(ValidationError::EmptyNames);
            }
            if names.iter().any(|n| n.trim().is_empty()) {
                return Err(ValidationError::BlankName);
            }
        }
        if self.device_id.as_deref().is_some_and(|d| d.trim().is_empty()) {
            return Err(ValidationError::BlankDeviceId);
        }
        Ok(())
    }

    /// Sub-topics to expand over; a single `None` when unrestricted.
    fn name_slots(&self) -> Vec<Option<String>> {
        match &self.names {
            Some(names) => names.iter().cloned().map(Some).collect(),
            None => vec![None],
        }
    }
}

/// Builds the filter set a caller is authorized to receive.
#[derive(Clone)]
pub struct FilterBuilder {
    entities: Arc<dyn EntityQuery>,
}

impl FilterBuilder {
    /// Creates a builder backed by the entity query service.
    #[must_use]
    pub fn new(entities: Arc<dyn EntityQuery>) -> Self {
        Self { entities }
    }

    /// Expands `params` into filters for `kind`, narrowed to what `principal`
    /// may access.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] for malformed parameters.
    /// - [`Error::NotFound`] when a requested device, network or device type
    ///   does not exist.
    /// - [`Error::Forbidden`] when the caller may not access a requested id,
    ///   or when the resulting scope is empty.
    pub async fn build(
        &self,
        kind: EventKind,
        params: &SubscribeParams,
        principal: &Principal,
    ) -> Result<Vec<Filter>> {
        params.validate()?;
        let names = params.name_slots();

        if let Some(device_id) = &params.device_id {
            let device = self.resolve_device(device_id, principal).await?;
            let filters = names
                .into_iter()
                .map(|name| Filter {
                    name,
                    ..Filter::for_device(kind, &device)
                })
                .collect();
            return Ok(filters);
        }

        let networks = self
            .effective_ids(Dimension::Networks, params.network_ids.as_ref(), principal)
            .await?;
        let device_types = self
            .effective_ids(
                Dimension::DeviceTypes,
                params.device_type_ids.as_ref(),
                principal,
            )
            .await?;

        let networks = slots(networks);
        let device_types = slots(device_types);

        let mut filters = BTreeSet::new();
        for network_id in &networks {
            for device_type_id in &device_types {
                for name in &names {
                    filters.insert(Filter {
                        name: name.clone(),
                        ..Filter::scoped(kind, *network_id, *device_type_id)
                    });
                }
            }
        }

        if filters.is_empty() {
            tracing::warn!(
                user = ?principal.user_id,
                kind = %kind,
                "Filter set is empty for principal"
            );
            return Err(Error::Forbidden(
                "no access to any device types or networks".to_string(),
            ));
        }

        Ok(filters.into_iter().collect())
    }

    /// Looks up a device the principal may access.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the device does not exist and
    /// [`Error::Forbidden`] if it exists but is not accessible.
    pub async fn resolve_device(&self, device_id: &str, principal: &Principal) -> Result<DeviceInfo> {
        let ids = [device_id.to_string()];
        if let Some(device) = self
            .entities
            .find_devices(&ids, Some(principal))
            .await?
            .into_iter()
            .next()
        {
            return Ok(device);
        }

        // Permission failed; only now find out whether it exists at all.
        let exists = !self.entities.find_devices(&ids, None).await?.is_empty();
        if exists {
            Err(Error::Forbidden(format!("access to device {device_id} denied")))
        } else {
            Err(Error::NotFound(format!("device {device_id} not found")))
        }
    }

    /// Resolves the ids to subscribe on along one dimension.
    ///
    /// `Ok(None)` means the dimension is unrestricted and stays a wildcard.
    async fn effective_ids(
        &self,
        dimension: Dimension,
        requested: Option<&BTreeSet<i64>>,
        principal: &Principal,
    ) -> Result<Option<BTreeSet<i64>>> {
        let access = principal.access(dimension);

        let Some(requested) = requested.filter(|ids| !ids.is_empty()) else {
            return match access {
                Access::All => Ok(None),
                Access::Listed(ids) => Ok(Some(ids.clone())),
                Access::Delegated => self
                    .list_ids(dimension, &ListCriteria::visible_to(principal))
                    .await
                    .map(Some),
            };
        };

        let permitted: BTreeSet<i64> = match access {
            Access::All => requested.clone(),
            Access::Listed(ids) => requested.intersection(ids).copied().collect(),
            Access::Delegated => {
                let criteria = ListCriteria {
                    ids: Some(requested.clone()),
                    principal: Some(principal.clone()),
                };
                self.list_ids(dimension, &criteria).await?
            }
        };

        let denied: BTreeSet<i64> = requested.difference(&permitted).copied().collect();
        if !denied.is_empty() {
            return Err(self.denial(dimension, &denied, principal).await?);
        }

        // Delegated listings only return existing ids; the rest must be checked.
        if !matches!(access, Access::Delegated) {
            let existing = self
                .list_ids(dimension, &ListCriteria::ids(requested.iter().copied()))
                .await?;
            let missing: BTreeSet<i64> = requested.difference(&existing).copied().collect();
            if !missing.is_empty() {
                return Err(not_found(dimension, &missing));
            }
        }

        Ok(Some(requested.clone()))
    }

    /// Picks between NotFound and Forbidden for ids the caller may not use.
    ///
    /// Clients never learn whether a denied id exists.
    async fn denial(
        &self,
        dimension: Dimension,
        denied: &BTreeSet<i64>,
        principal: &Principal,
    ) -> Result<Error> {
        if principal.is_client() {
            return Ok(forbidden(dimension, denied));
        }
        let existing = self
            .list_ids(dimension, &ListCriteria::ids(denied.iter().copied()))
            .await?;
        if existing.is_empty() {
            Ok(not_found(dimension, denied))
        } else {
            Ok(forbidden(dimension, denied))
        }
    }

    async fn list_ids(&self, dimension: Dimension, criteria: &ListCriteria) -> Result<BTreeSet<i64>> {
        Ok(match dimension {
            Dimension::Networks => self
                .entities
                .list_networks(criteria)
                .await?
                .into_iter()
                .map(|n| n.id)
                .collect(),
            Dimension::DeviceTypes => self
                .entities
                .list_device_types(criteria)
                .await?
                .into_iter()
                .map(|t| t.id)
                .collect(),
        })
    }
}

impl std::fmt::Debug for FilterBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterBuilder").finish_non_exhaustive()
    }
}

/// Expands an effective id set into filter slots; `None` becomes one wildcard slot.
fn slots(ids: Option<BTreeSet<i64>>) -> Vec<Option<i64>> {
    match ids {
        Some(ids) => ids.into_iter().map(Some).collect(),
        None => vec![None],
    }
}

fn dimension_label(dimension: Dimension) -> &'static str {
    match dimension {
        Dimension::Networks => "networks",
        Dimension::DeviceTypes => "device types",
    }
}

fn not_found(dimension: Dimension, ids: &BTreeSet<i64>) -> Error {
    Error::NotFound(format!("{} {ids:?} not found", dimension_label(dimension)))
}

fn forbidden(dimension: Dimension, ids: &BTreeSet<i64>) -> Error {
    Error::Forbidden(format!(
        "access to {} {ids:?} denied",
        dimension_label(dimension)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeviceTypeInfo, NetworkInfo};
    use async_trait::async_trait;

    /// Networks 5 and 6, device types 1 and 2, device D1 in network 5 / type 1.
    struct Catalog;

    fn visible(ids: &[i64], criteria: &ListCriteria, access: fn(&Principal) -> &Access) -> Vec<i64> {
        ids.iter()
            .copied()
            .filter(|id| criteria.ids.as_ref().is_none_or(|want| want.contains(id)))
            .filter(|id| {
                criteria
                    .principal
                    .as_ref()
                    .is_none_or(|p| access(p).permits(*id).unwrap_or(*id == 5 || *id == 1))
            })
            .collect()
    }

    #[async_trait]
    impl EntityQuery for Catalog {
        async fn find_devices(
            &self,
            ids: &[String],
            principal: Option<&Principal>,
        ) -> Result<Vec<DeviceInfo>> {
            let d1 = DeviceInfo::new("D1").with_network(5).with_device_type(1);
            let allowed = principal.is_none_or(|p| p.networks.permits(5).unwrap_or(true));
            Ok(ids
                .iter()
                .filter(|id| *id == "D1" && allowed)
                .map(|_| d1.clone())
                .collect())
        }

        async fn list_networks(&self, criteria: &ListCriteria) -> Result<Vec<NetworkInfo>> {
            Ok(visible(&[5, 6], criteria, |p| &p.networks)
                .into_iter()
                .map(|id| NetworkInfo {
                    id,
                    name: format!("net-{id}"),
                })
                .collect())
        }

        async fn list_device_types(&self, criteria: &ListCriteria) -> Result<Vec<DeviceTypeInfo>> {
            Ok(visible(&[1, 2], criteria, |p| &p.device_types)
                .into_iter()
                .map(|id| DeviceTypeInfo {
                    id,
                    name: format!("type-{id}"),
                })
                .collect())
        }
    }

    fn builder() -> FilterBuilder {
        FilterBuilder::new(Arc::new(Catalog))
    }

    #[tokio::test]
    async fn admin_without_scope_gets_global_filter_per_name() {
        let params = SubscribeParams::new().names(["a", "b"]);
        let filters = builder()
            .build(EventKind::Notification, &params, &Principal::admin(1))
            .await
            .unwrap();
        assert_eq!(filters.len(), 2);
        assert!(filters.iter().all(|f| f.network_id.is_none() && f.device_id.is_none()));
    }

    #[tokio::test]
    async fn device_filter_uses_device_scope() {
        let params = SubscribeParams::new().device("D1").names(["temp"]);
        let filters = builder()
            .build(EventKind::Notification, &params, &Principal::admin(1))
            .await
            .unwrap();
        assert_eq!(
            filters,
            vec![Filter {
                kind: EventKind::Notification,
                network_id: Some(5),
                device_type_id: Some(1),
                device_id: Some("D1".into()),
                name: Some("temp".into()),
            }]
        );
    }

    #[tokio::test]
    async fn unknown_device_is_not_found() {
        let params = SubscribeParams::new().device("nope");
        let err = builder()
            .build(EventKind::Command, &params, &Principal::admin(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn inaccessible_device_is_forbidden() {
        let client = Principal::client(2).with_networks([6]);
        let params = SubscribeParams::new().device("D1");
        let err = builder()
            .build(EventKind::Command, &params, &client)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
    }

    #[tokio::test]
    async fn client_requesting_unpermitted_network_is_forbidden() {
        let client = Principal::client(2).with_networks([5]);
        let params = SubscribeParams::new().networks([5, 6]);
        let err = builder()
            .build(EventKind::Notification, &params, &client)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
    }

    #[tokio::test]
    async fn admin_requesting_missing_network_is_not_found() {
        let params = SubscribeParams::new().networks([5, 99]);
        let err = builder()
            .build(EventKind::Notification, &params, &Principal::admin(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn cartesian_product_of_networks_types_and_names() {
        let params = SubscribeParams::new()
            .networks([5, 6])
            .device_types([1, 2])
            .names(["x", "y"]);
        let filters = builder()
            .build(EventKind::Command, &params, &Principal::admin(1))
            .await
            .unwrap();
        assert_eq!(filters.len(), 8);
    }

    #[tokio::test]
    async fn delegated_networks_are_enumerated_through_backend() {
        // Catalog grants delegated principals network 5 only.
        let client = Principal::client(3);
        let filters = builder()
            .build(EventKind::Notification, &SubscribeParams::new(), &client)
            .await
            .unwrap();
        assert_eq!(filters.len(), 1);
        assert_eq!(filters[0].network_id, Some(5));
        assert_eq!(filters[0].device_type_id, None);
    }

    #[tokio::test]
    async fn empty_names_rejected_before_lookup() {
        let params = SubscribeParams {
            names: Some(BTreeSet::new()),
            ..SubscribeParams::default()
        };
        let err = builder()
            .build(EventKind::Notification, &params, &Principal::admin(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(ValidationError::EmptyNames)));
    }

    #[tokio::test]
    async fn empty_listed_scope_is_forbidden() {
        let client = Principal::client(4).with_networks(Vec::<i64>::new());
        let err = builder()
            .build(EventKind::Notification, &SubscribeParams::new(), &client)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
    }
}
