// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Cascading Deletion Order
//!
//! The record kinds that reference a resource, in the order they must be
//! removed before the resource rows themselves. Each storage backend maps a
//! [`DependentKind`] to one delete operation; the subtree deleter walks
//! [`DELETION_ORDER`] mechanically for every batch.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependentKind {
    ExplicitGroupMembership,
    ImplicitGroupMembership,
    MeasurementBaseline,
    MeasurementTrait,
    CallTimeDataValue,
    CallTimeDataKey,
    MeasurementSchedule,
    Availability,
    ResourceError,
    Event,
    EventSource,
    PackageInstallationStep,
    InstalledPackageHistory,
    InstalledPackage,
    ContentServiceRequest,
    OperationSchedule,
    OperationHistory,
    DeleteResourceHistory,
    CreateResourceHistory,
    ResourceConfigurationUpdate,
    ResourceConfiguration,
    PluginConfigurationUpdate,
    PluginConfiguration,
    AlertConditionLog,
    AlertNotificationLog,
    Alert,
    AlertCondition,
    AlertDampeningEvent,
    AlertNotification,
    AlertDefinition,
}

/// Dependency-respecting removal order.
///
/// Baselines, traits and call-time data go before their schedules; package
/// steps before history before packages; configuration updates before the
/// configurations they wrap. The alert block must stay in this exact order.
pub const DELETION_ORDER: &[DependentKind] = &[
    DependentKind::ExplicitGroupMembership,
    DependentKind::ImplicitGroupMembership,
    DependentKind::MeasurementBaseline,
    DependentKind::MeasurementTrait,
    DependentKind::CallTimeDataValue,
    DependentKind::CallTimeDataKey,
    DependentKind::MeasurementSchedule,
    DependentKind::Availability,
    DependentKind::ResourceError,
    DependentKind::Event,
    DependentKind::EventSource,
    DependentKind::PackageInstallationStep,
    DependentKind::InstalledPackageHistory,
    DependentKind::InstalledPackage,
    DependentKind::ContentServiceRequest,
    DependentKind::OperationSchedule,
    DependentKind::OperationHistory,
    DependentKind::DeleteResourceHistory,
    DependentKind::CreateResourceHistory,
    DependentKind::ResourceConfigurationUpdate,
    DependentKind::ResourceConfiguration,
    DependentKind::PluginConfigurationUpdate,
    DependentKind::PluginConfiguration,
    DependentKind::AlertConditionLog,
    DependentKind::AlertNotificationLog,
    DependentKind::Alert,
    DependentKind::AlertCondition,
    DependentKind::AlertDampeningEvent,
    DependentKind::AlertNotification,
    DependentKind::AlertDefinition,
];

impl DependentKind {
    /// Backing table in the relational schema.
    pub fn table(&self) -> &'static str {
        match self {
            Self::ExplicitGroupMembership => "group_explicit_members",
            Self::ImplicitGroupMembership => "group_implicit_members",
            Self::MeasurementBaseline => "measurement_baselines",
            Self::MeasurementTrait => "measurement_traits",
            Self::CallTimeDataValue => "calltime_data_values",
            Self::CallTimeDataKey => "calltime_data_keys",
            Self::MeasurementSchedule => "measurement_schedules",
            Self::Availability => "availability",
            Self::ResourceError => "resource_errors",
            Self::Event => "events",
            Self::EventSource => "event_sources",
            Self::PackageInstallationStep => "package_installation_steps",
            Self::InstalledPackageHistory => "installed_package_history",
            Self::InstalledPackage => "installed_packages",
            Self::ContentServiceRequest => "content_service_requests",
            Self::OperationSchedule => "operation_schedules",
            Self::OperationHistory => "operation_history",
            Self::DeleteResourceHistory => "lifecycle_history",
            Self::CreateResourceHistory => "lifecycle_history",
            Self::ResourceConfigurationUpdate => "resource_config_updates",
            Self::ResourceConfiguration => "resource_configurations",
            Self::PluginConfigurationUpdate => "plugin_config_updates",
            Self::PluginConfiguration => "plugin_configurations",
            Self::AlertConditionLog => "alert_condition_logs",
            Self::AlertNotificationLog => "alert_notification_logs",
            Self::Alert => "alerts",
            Self::AlertCondition => "alert_conditions",
            Self::AlertDampeningEvent => "alert_dampening_events",
            Self::AlertNotification => "alert_notifications",
            Self::AlertDefinition => "alert_definitions",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn position(kind: DependentKind) -> usize {
        DELETION_ORDER.iter().position(|k| *k == kind).unwrap()
    }

    #[test]
    fn test_every_kind_appears_once() {
        let unique: HashSet<_> = DELETION_ORDER.iter().collect();
        assert_eq!(unique.len(), DELETION_ORDER.len());
        assert_eq!(DELETION_ORDER.len(), 30);
    }

    #[test]
    fn test_measurement_data_before_schedules() {
        let schedules = position(DependentKind::MeasurementSchedule);
        assert!(position(DependentKind::MeasurementBaseline) < schedules);
        assert!(position(DependentKind::MeasurementTrait) < schedules);
        assert!(position(DependentKind::CallTimeDataValue) < position(DependentKind::CallTimeDataKey));
        assert!(position(DependentKind::CallTimeDataKey) < schedules);
    }

    #[test]
    fn test_package_and_configuration_ordering() {
        assert!(position(DependentKind::PackageInstallationStep) < position(DependentKind::InstalledPackageHistory));
        assert!(position(DependentKind::InstalledPackageHistory) < position(DependentKind::InstalledPackage));
        assert!(position(DependentKind::InstalledPackage) < position(DependentKind::ContentServiceRequest));
        assert!(position(DependentKind::ResourceConfigurationUpdate) < position(DependentKind::ResourceConfiguration));
        assert!(position(DependentKind::PluginConfigurationUpdate) < position(DependentKind::PluginConfiguration));
    }

    #[test]
    fn test_group_membership_first_and_alert_definitions_last() {
        assert_eq!(DELETION_ORDER[0], DependentKind::ExplicitGroupMembership);
        assert_eq!(*DELETION_ORDER.last().unwrap(), DependentKind::AlertDefinition);
        assert!(position(DependentKind::Alert) < position(DependentKind::AlertCondition));
        assert!(position(DependentKind::AlertNotificationLog) < position(DependentKind::Alert));
    }
}
