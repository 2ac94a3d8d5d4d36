//! The host's dynamic redirect rule table.
//!
//! [`RedirectHost`] is the seam to the native declarative rule API.
//! [`InMemoryHost`] implements it with the host's semantics: updates are
//! atomic, removals apply before additions, ids must be unique, the table
//! has a quota, and filters are validated before anything changes.

use crate::directive::{DynamicRulesUpdate, RedirectDirective};
use crate::rule::RuleId;
use crate::url_filter::{FilterError, UrlFilter};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

/// Default dynamic rule quota.
pub const DEFAULT_MAX_DYNAMIC_RULES: usize = 5000;

/// Rejections from the host API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    #[error("rule with id {id} has an invalid url filter: {source}")]
    InvalidFilter { id: RuleId, source: FilterError },
    #[error("rule with id {0} does not have a unique id")]
    DuplicateId(RuleId),
    #[error("dynamic rule count exceeded: {requested} rules requested, limit is {limit}")]
    QuotaExceeded { requested: usize, limit: usize },
    #[error("rule with id {0} specifies an invalid redirect url")]
    InvalidRedirect(RuleId),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("host unavailable: {0}")]
    Unavailable(String),
}

/// Native redirect rule API.
#[async_trait]
pub trait RedirectHost: Send + Sync {
    /// Apply one atomic update: remove `remove_rule_ids`, then add `add_rules`.
    async fn update_dynamic_rules(&self, update: DynamicRulesUpdate) -> Result<(), HostError>;

    /// Read back the active dynamic rules.
    async fn get_dynamic_rules(&self) -> Result<Vec<RedirectDirective>, HostError>;
}

/// A request as seen by the host's rule evaluation.
#[derive(Debug, Clone)]
pub struct RequestDetails<'a> {
    pub url: &'a str,
    /// Lower-case method, as in `requestMethods`
    pub method: &'a str,
    pub resource_type: &'a str,
}

struct ActiveDirective {
    directive: RedirectDirective,
    filter: UrlFilter,
}

/// In-process dynamic rule table.
pub struct InMemoryHost {
    table: Mutex<BTreeMap<RuleId, ActiveDirective>>,
    max_rules: usize,
    /// Error returned by the next update, then cleared
    next_failure: Mutex<Option<HostError>>,
}

impl Default for InMemoryHost {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DYNAMIC_RULES)
    }
}

impl InMemoryHost {
    /// Create an empty table with the given quota.
    pub fn new(max_rules: usize) -> Self {
        Self {
            table: Mutex::new(BTreeMap::new()),
            max_rules,
            next_failure: Mutex::new(None),
        }
    }

    /// Make the next update fail with `error` without touching the table.
    pub fn fail_next_update(&self, error: HostError) {
        *lock(&self.next_failure) = Some(error);
    }

    /// Ids of the active directives, ascending.
    pub fn active_ids(&self) -> Vec<RuleId> {
        lock(&self.table).keys().copied().collect()
    }

    /// Number of active directives.
    pub fn len(&self) -> usize {
        lock(&self.table).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up an active directive.
    pub fn directive(&self, id: RuleId) -> Option<RedirectDirective> {
        lock(&self.table).get(&id).map(|a| a.directive.clone())
    }

    /// Find the directive that would redirect `request`.
    ///
    /// Highest priority wins; ties go to the lowest id.
    pub fn evaluate(&self, request: &RequestDetails<'_>) -> Option<RedirectDirective> {
        let table = lock(&self.table);
        let mut best: Option<&ActiveDirective> = None;
        for active in table.values() {
            if !condition_matches(active, request) {
                continue;
            }
            match best {
                Some(b) if b.directive.priority >= active.directive.priority => {}
                _ => best = Some(active),
            }
        }
        best.map(|a| a.directive.clone())
    }
}

fn condition_matches(active: &ActiveDirective, request: &RequestDetails<'_>) -> bool {
    let condition = &active.directive.condition;
    if !condition.request_methods.is_empty()
        && !condition
            .request_methods
            .iter()
            .any(|m| m.eq_ignore_ascii_case(request.method))
    {
        return false;
    }
    if !condition.resource_types.is_empty()
        && !condition
            .resource_types
            .iter()
            .any(|t| t == request.resource_type)
    {
        return false;
    }
    active.filter.is_match(request.url)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl RedirectHost for InMemoryHost {
    async fn update_dynamic_rules(&self, update: DynamicRulesUpdate) -> Result<(), HostError> {
        if let Some(error) = lock(&self.next_failure).take() {
            return Err(error);
        }

        // Validate everything before touching the table so a rejected update changes nothing.
        let mut compiled = Vec::with_capacity(update.add_rules.len());
        let mut seen = HashSet::new();
        for directive in &update.add_rules {
            if !seen.insert(directive.id) {
                return Err(HostError::DuplicateId(directive.id));
            }
            if !directive.action.redirect_url().starts_with("data:")
                && !directive.action.redirect_url().contains("://")
            {
                return Err(HostError::InvalidRedirect(directive.id));
            }
            let filter = UrlFilter::parse(&directive.condition.url_filter).map_err(|source| {
                HostError::InvalidFilter {
                    id: directive.id,
                    source,
                }
            })?;
            compiled.push(filter);
        }

        let mut table = lock(&self.table);
        let removed: HashSet<RuleId> = update.remove_rule_ids.iter().copied().collect();
        for directive in &update.add_rules {
            if table.contains_key(&directive.id) && !removed.contains(&directive.id) {
                return Err(HostError::DuplicateId(directive.id));
            }
        }

        let surviving = table.keys().filter(|id| !removed.contains(id)).count();
        let requested = surviving + update.add_rules.len();
        if requested > self.max_rules {
            return Err(HostError::QuotaExceeded {
                requested,
                limit: self.max_rules,
            });
        }

        for id in &update.remove_rule_ids {
            if table.remove(id).is_some() {
                debug!(rule_id = id, "Removed redirect directive");
            }
        }
        for (directive, filter) in update.add_rules.into_iter().zip(compiled) {
            debug!(rule_id = directive.id, url_filter = %filter.as_str(), "Added redirect directive");
            table.insert(directive.id, ActiveDirective { directive, filter });
        }
        Ok(())
    }

    async fn get_dynamic_rules(&self) -> Result<Vec<RedirectDirective>, HostError> {
        Ok(lock(&self.table)
            .values()
            .map(|a| a.directive.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directive::{RedirectEncoding, XHR_RESOURCE_TYPE};
    use crate::rule::{HttpMethod, Rule, RuleDraft};
    use tokio_test::{assert_err, assert_ok};

    fn directive(id: RuleId, path: &str, method: HttpMethod) -> RedirectDirective {
        let rule = Rule::from_draft(id, RuleDraft::new(path, method, r#"{"id":1}"#));
        RedirectDirective::from_rule(&rule, RedirectEncoding::Plain)
    }

    fn add(directives: Vec<RedirectDirective>) -> DynamicRulesUpdate {
        DynamicRulesUpdate {
            remove_rule_ids: vec![],
            add_rules: directives,
        }
    }

    #[tokio::test]
    async fn test_add_and_remove() {
        let host = InMemoryHost::default();
        assert_ok!(
            host.update_dynamic_rules(add(vec![
                directive(1, "/a", HttpMethod::Get),
                directive(2, "/b", HttpMethod::Post),
            ]))
            .await
        );
        assert_eq!(host.active_ids(), vec![1, 2]);

        // Unknown ids in the removal list are ignored.
        assert_ok!(
            host.update_dynamic_rules(DynamicRulesUpdate {
                remove_rule_ids: vec![1, 99],
                add_rules: vec![],
            })
            .await
        );
        assert_eq!(host.active_ids(), vec![2]);
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected_without_change() {
        let host = InMemoryHost::default();
        host.update_dynamic_rules(add(vec![directive(1, "/a", HttpMethod::Get)]))
            .await
            .unwrap();

        let err = assert_err!(
            host.update_dynamic_rules(add(vec![
                directive(2, "/b", HttpMethod::Get),
                directive(1, "/c", HttpMethod::Get),
            ]))
            .await
        );
        assert_eq!(err, HostError::DuplicateId(1));
        assert_eq!(host.active_ids(), vec![1]);
        assert_eq!(host.directive(1).unwrap().condition.url_filter, "/a");
    }

    #[tokio::test]
    async fn test_remove_then_add_same_id() {
        let host = InMemoryHost::default();
        host.update_dynamic_rules(add(vec![directive(1, "/a", HttpMethod::Get)]))
            .await
            .unwrap();
        host.update_dynamic_rules(DynamicRulesUpdate {
            remove_rule_ids: vec![1],
            add_rules: vec![directive(1, "/new", HttpMethod::Get)],
        })
        .await
        .unwrap();
        assert_eq!(host.len(), 1);
        assert_eq!(host.directive(1).unwrap().condition.url_filter, "/new");
    }

    #[tokio::test]
    async fn test_quota() {
        let host = InMemoryHost::new(2);
        let err = host
            .update_dynamic_rules(add(vec![
                directive(1, "/a", HttpMethod::Get),
                directive(2, "/b", HttpMethod::Get),
                directive(3, "/c", HttpMethod::Get),
            ]))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            HostError::QuotaExceeded {
                requested: 3,
                limit: 2
            }
        );
        assert!(host.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_filter() {
        let host = InMemoryHost::default();
        let err = host
            .update_dynamic_rules(add(vec![directive(5, "/a|b", HttpMethod::Get)]))
            .await
            .unwrap_err();
        assert!(matches!(err, HostError::InvalidFilter { id: 5, .. }));
    }

    #[tokio::test]
    async fn test_injected_failure_is_one_shot() {
        let host = InMemoryHost::default();
        host.fail_next_update(HostError::PermissionDenied("declarativeNetRequest".into()));
        assert!(host
            .update_dynamic_rules(add(vec![directive(1, "/a", HttpMethod::Get)]))
            .await
            .is_err());
        assert!(host
            .update_dynamic_rules(add(vec![directive(1, "/a", HttpMethod::Get)]))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_evaluate() {
        let host = InMemoryHost::default();
        host.update_dynamic_rules(add(vec![
            directive(1, "/api/users", HttpMethod::Get),
            directive(2, "/api/", HttpMethod::Post),
        ]))
        .await
        .unwrap();

        let hit = host.evaluate(&RequestDetails {
            url: "https://example.com/api/users?page=1",
            method: "get",
            resource_type: XHR_RESOURCE_TYPE,
        });
        assert_eq!(hit.unwrap().id, 1);

        let miss = host.evaluate(&RequestDetails {
            url: "https://example.com/api/users",
            method: "delete",
            resource_type: XHR_RESOURCE_TYPE,
        });
        assert!(miss.is_none());

        let wrong_type = host.evaluate(&RequestDetails {
            url: "https://example.com/api/users",
            method: "get",
            resource_type: "main_frame",
        });
        assert!(wrong_type.is_none());
    }
}
