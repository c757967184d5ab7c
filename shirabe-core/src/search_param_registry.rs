use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::search_param::SearchParamType;

/// Active definition of a single search parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeSearchParam {
    /// Search parameter name (e.g. "family", "code")
    pub name: String,
    pub param_type: SearchParamType,
    /// FHIRPath-style expression; alternatives are separated by `|`
    pub path: String,
    /// Resource types a reference parameter may point at (empty = any)
    pub targets: BTreeSet<String>,
    /// Component parameter names of a composite, in declaration order
    pub components: Vec<String>,
    /// Whether the `:text` modifier may be used on this token parameter
    pub text_indexed: bool,
}

impl RuntimeSearchParam {
    pub fn new(name: &str, param_type: SearchParamType, path: &str) -> Self {
        Self {
            name: name.to_string(),
            param_type,
            path: path.to_string(),
            targets: BTreeSet::new(),
            components: Vec::new(),
            text_indexed: false,
        }
    }

    pub fn with_targets(mut self, targets: &[&str]) -> Self {
        self.targets = targets.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_components(mut self, components: &[&str]) -> Self {
        self.components = components.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn text_indexed(mut self) -> Self {
        self.text_indexed = true;
        self
    }

    /// Individual path alternatives (`Observation.subject | Observation.focus`)
    pub fn paths_split(&self) -> Vec<&str> {
        self.path
            .split('|')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect()
    }
}

/// A combination of parameters backed by a composite unique index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueComboParam {
    pub resource_type: String,
    /// Component names, sorted
    pub components: Vec<String>,
}

/// Lookup of active search parameters.
///
/// Implementations are shared across concurrent searches and must be safe
/// for concurrent reads.
pub trait SearchParamRegistry: Send + Sync {
    fn get_active_search_param(
        &self,
        resource_type: &str,
        name: &str,
    ) -> Option<Arc<RuntimeSearchParam>>;

    /// All active parameters of a resource type, keyed (and therefore sorted) by name
    fn get_active_search_params(
        &self,
        resource_type: &str,
    ) -> BTreeMap<String, Arc<RuntimeSearchParam>>;

    /// Unique composite indexes whose components are exactly `param_names`
    fn get_active_unique_search_params(
        &self,
        resource_type: &str,
        param_names: &BTreeSet<String>,
    ) -> Vec<Arc<UniqueComboParam>>;

    fn is_resource_type(&self, resource_type: &str) -> bool;
}

/// In-memory registry preloaded with the built-in parameter set
#[derive(Debug, Clone)]
pub struct InMemorySearchParamRegistry {
    params: HashMap<String, BTreeMap<String, Arc<RuntimeSearchParam>>>,
    unique: HashMap<String, Vec<Arc<UniqueComboParam>>>,
}

impl InMemorySearchParamRegistry {
    /// Registry without any definitions
    pub fn empty() -> Self {
        Self {
            params: HashMap::new(),
            unique: HashMap::new(),
        }
    }

    /// Registry with the default definitions for all supported resource types
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register_all("Patient", patient_definitions());
        registry.register_all("Observation", observation_definitions());
        registry.register_all("Encounter", encounter_definitions());
        registry.register_all("Condition", condition_definitions());
        registry.register_all("Organization", organization_definitions());
        registry.register_all("Practitioner", practitioner_definitions());
        registry.register_all("Location", location_definitions());
        registry.register_all("RiskAssessment", risk_assessment_definitions());
        registry.register_all("Group", group_definitions());
        registry.register_all("AuditEvent", audit_event_definitions());
        registry.register_all("Device", device_definitions());
        registry.register_all("Provenance", provenance_definitions());
        registry
    }

    pub fn register(&mut self, resource_type: &str, param: RuntimeSearchParam) {
        self.params
            .entry(resource_type.to_string())
            .or_default()
            .insert(param.name.clone(), Arc::new(param));
    }

    fn register_all(&mut self, resource_type: &str, params: Vec<RuntimeSearchParam>) {
        for param in params {
            self.register(resource_type, param);
        }
    }

    /// Declare a composite unique index over the given parameters
    pub fn register_unique_combo(&mut self, resource_type: &str, components: &[&str]) {
        let mut components: Vec<String> = components.iter().map(|c| c.to_string()).collect();
        components.sort();
        self.unique
            .entry(resource_type.to_string())
            .or_default()
            .push(Arc::new(UniqueComboParam {
                resource_type: resource_type.to_string(),
                components,
            }));
    }
}

impl Default for InMemorySearchParamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SearchParamRegistry for InMemorySearchParamRegistry {
    fn get_active_search_param(
        &self,
        resource_type: &str,
        name: &str,
    ) -> Option<Arc<RuntimeSearchParam>> {
        self.params.get(resource_type)?.get(name).cloned()
    }

    fn get_active_search_params(
        &self,
        resource_type: &str,
    ) -> BTreeMap<String, Arc<RuntimeSearchParam>> {
        self.params.get(resource_type).cloned().unwrap_or_default()
    }

    fn get_active_unique_search_params(
        &self,
        resource_type: &str,
        param_names: &BTreeSet<String>,
    ) -> Vec<Arc<UniqueComboParam>> {
        self.unique
            .get(resource_type)
            .map(|combos| {
                combos
                    .iter()
                    .filter(|c| {
                        c.components.len() == param_names.len()
                            && c.components.iter().all(|n| param_names.contains(n))
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn is_resource_type(&self, resource_type: &str) -> bool {
        self.params.contains_key(resource_type)
    }
}

// --- Per-resource definitions ---

use SearchParamType::{
    Composite, Date, Number, Quantity, Reference, Special, String as Str, Token, Uri,
};

fn sp(name: &str, param_type: SearchParamType, path: &str) -> RuntimeSearchParam {
    RuntimeSearchParam::new(name, param_type, path)
}

fn patient_definitions() -> Vec<RuntimeSearchParam> {
    vec![
        sp("identifier", Token, "Patient.identifier"),
        sp("name", Str, "Patient.name"),
        sp("family", Str, "Patient.name.family"),
        sp("given", Str, "Patient.name.given"),
        sp("birthdate", Date, "Patient.birthDate"),
        sp("gender", Token, "Patient.gender"),
        sp("active", Token, "Patient.active"),
        sp("telecom", Token, "Patient.telecom"),
        sp("address-city", Str, "Patient.address.city"),
        sp("organization", Reference, "Patient.managingOrganization")
            .with_targets(&["Organization"]),
        sp("general-practitioner", Reference, "Patient.generalPractitioner")
            .with_targets(&["Practitioner", "Organization"]),
        sp("link", Reference, "Patient.link.other").with_targets(&["Patient"]),
    ]
}

fn observation_definitions() -> Vec<RuntimeSearchParam> {
    vec![
        sp("code", Token, "Observation.code").text_indexed(),
        sp("category", Token, "Observation.category"),
        sp("status", Token, "Observation.status"),
        sp("identifier", Token, "Observation.identifier"),
        sp("date", Date, "Observation.effective"),
        sp("value-quantity", Quantity, "Observation.value.as(Quantity)"),
        sp("value-string", Str, "Observation.value.as(string)"),
        sp("value-concept", Token, "Observation.value.as(CodeableConcept)"),
        sp("subject", Reference, "Observation.subject")
            .with_targets(&["Patient", "Group", "Device", "Location"]),
        sp("patient", Reference, "Observation.subject").with_targets(&["Patient"]),
        sp("encounter", Reference, "Observation.encounter").with_targets(&["Encounter"]),
        sp("performer", Reference, "Observation.performer")
            .with_targets(&["Practitioner", "Organization", "Patient"]),
        sp("has-member", Reference, "Observation.hasMember").with_targets(&["Observation"]),
        sp("code-value-quantity", Composite, "Observation")
            .with_components(&["code", "value-quantity"]),
        sp("code-value-concept", Composite, "Observation")
            .with_components(&["code", "value-concept"]),
    ]
}

fn encounter_definitions() -> Vec<RuntimeSearchParam> {
    vec![
        sp("identifier", Token, "Encounter.identifier"),
        sp("status", Token, "Encounter.status"),
        sp("class", Token, "Encounter.class"),
        sp("date", Date, "Encounter.period"),
        sp("length", Quantity, "Encounter.length"),
        sp("subject", Reference, "Encounter.subject").with_targets(&["Patient", "Group"]),
        sp("patient", Reference, "Encounter.subject").with_targets(&["Patient"]),
        sp("participant", Reference, "Encounter.participant.individual")
            .with_targets(&["Practitioner"]),
        sp("service-provider", Reference, "Encounter.serviceProvider")
            .with_targets(&["Organization"]),
    ]
}

fn condition_definitions() -> Vec<RuntimeSearchParam> {
    vec![
        sp("code", Token, "Condition.code").text_indexed(),
        sp("clinical-status", Token, "Condition.clinicalStatus"),
        sp("onset-date", Date, "Condition.onset.as(dateTime)"),
        sp("subject", Reference, "Condition.subject").with_targets(&["Patient", "Group"]),
        sp("patient", Reference, "Condition.subject").with_targets(&["Patient"]),
        sp("encounter", Reference, "Condition.encounter").with_targets(&["Encounter"]),
    ]
}

fn organization_definitions() -> Vec<RuntimeSearchParam> {
    vec![
        sp("identifier", Token, "Organization.identifier"),
        sp("name", Str, "Organization.name"),
        sp("type", Token, "Organization.type"),
        sp("address-city", Str, "Organization.address.city"),
        sp("partof", Reference, "Organization.partOf").with_targets(&["Organization"]),
        sp("endpoint", Uri, "Organization.endpoint.address"),
    ]
}

fn practitioner_definitions() -> Vec<RuntimeSearchParam> {
    vec![
        sp("identifier", Token, "Practitioner.identifier"),
        sp("name", Str, "Practitioner.name"),
        sp("family", Str, "Practitioner.name.family"),
        sp("given", Str, "Practitioner.name.given"),
    ]
}

fn location_definitions() -> Vec<RuntimeSearchParam> {
    vec![
        sp("name", Str, "Location.name"),
        sp("address-city", Str, "Location.address.city"),
        sp("near", Special, "Location.position"),
        sp("organization", Reference, "Location.managingOrganization")
            .with_targets(&["Organization"]),
    ]
}

fn risk_assessment_definitions() -> Vec<RuntimeSearchParam> {
    vec![
        sp("probability", Number, "RiskAssessment.prediction.probability"),
        sp("subject", Reference, "RiskAssessment.subject").with_targets(&["Patient", "Group"]),
    ]
}

fn group_definitions() -> Vec<RuntimeSearchParam> {
    vec![
        sp("code", Token, "Group.code"),
        sp("member", Reference, "Group.member.entity")
            .with_targets(&["Patient", "Practitioner", "Device"]),
    ]
}

fn audit_event_definitions() -> Vec<RuntimeSearchParam> {
    vec![
        sp("type", Token, "AuditEvent.type"),
        sp("date", Date, "AuditEvent.recorded"),
        // Untyped reference: any resource can be an entity
        sp("entity", Reference, "AuditEvent.entity.what"),
        sp("policy", Uri, "AuditEvent.agent.policy"),
    ]
}

fn device_definitions() -> Vec<RuntimeSearchParam> {
    vec![
        sp("type", Token, "Device.type"),
        sp("url", Uri, "Device.url"),
        sp("patient", Reference, "Device.patient").with_targets(&["Patient"]),
    ]
}

fn provenance_definitions() -> Vec<RuntimeSearchParam> {
    vec![
        sp("target", Reference, "Provenance.target"),
        sp("recorded", Date, "Provenance.recorded"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_builtin_param() {
        let registry = InMemorySearchParamRegistry::new();
        let subject = registry
            .get_active_search_param("Observation", "subject")
            .unwrap();
        assert_eq!(subject.param_type, SearchParamType::Reference);
        assert!(subject.targets.contains("Patient"));
        assert!(registry.get_active_search_param("Observation", "nope").is_none());
        assert!(registry.get_active_search_param("Nope", "code").is_none());
    }

    #[test]
    fn test_active_params_are_sorted() {
        let registry = InMemorySearchParamRegistry::new();
        let names: Vec<String> = registry
            .get_active_search_params("Patient")
            .into_keys()
            .collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        assert!(names.contains(&"birthdate".to_string()));
    }

    #[test]
    fn test_paths_split() {
        let param = RuntimeSearchParam::new(
            "subject",
            SearchParamType::Reference,
            "Observation.subject | Observation.focus",
        );
        assert_eq!(
            param.paths_split(),
            vec!["Observation.subject", "Observation.focus"]
        );
    }

    #[test]
    fn test_unique_combo_requires_exact_component_set() {
        let mut registry = InMemorySearchParamRegistry::new();
        registry.register_unique_combo("Patient", &["family", "birthdate"]);

        let both: BTreeSet<String> = ["birthdate", "family"].iter().map(|s| s.to_string()).collect();
        let found = registry.get_active_unique_search_params("Patient", &both);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].components, vec!["birthdate", "family"]);

        let one: BTreeSet<String> = ["family"].iter().map(|s| s.to_string()).collect();
        assert!(registry.get_active_unique_search_params("Patient", &one).is_empty());
    }

    #[test]
    fn test_resource_type_known() {
        let registry = InMemorySearchParamRegistry::new();
        assert!(registry.is_resource_type("Patient"));
        assert!(!registry.is_resource_type("Spaceship"));
    }
}
