pub mod matchers;
pub mod steps;

use futures_util::future::join_all;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc, Mutex,
};

use crate::common::data::{CompletionPolicy, RuleDefinition};
use crate::server::events::RequestSnapshot;
use crate::server::intake::OngoingRequest;
use matchers::Matcher;
use steps::Step;

/// A rule ready for registration: matchers, steps and completion policy,
/// without an identity yet.
pub struct RuleSpec {
    pub priority: i32,
    pub matchers: Vec<Box<dyn Matcher>>,
    pub steps: Vec<Box<dyn Step>>,
    pub completion: CompletionPolicy,
}

impl RuleSpec {
    pub fn from_definition(definition: RuleDefinition) -> Result<Self, steps::Error> {
        let matchers = definition
            .matchers
            .into_iter()
            .map(matchers::from_config)
            .collect();
        let steps = definition
            .steps
            .into_iter()
            .map(steps::from_config)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(RuleSpec {
            priority: definition.priority,
            matchers,
            steps,
            completion: definition.completion,
        })
    }
}

/// A registered rule. The handled counter and seen-request list are the only
/// mutable parts; both are updated after successful step dispatch.
pub struct Rule {
    id: usize,
    priority: i32,
    matchers: Vec<Box<dyn Matcher>>,
    steps: Vec<Box<dyn Step>>,
    completion: CompletionPolicy,
    handled: AtomicU64,
    disposed: AtomicBool,
    seen: Mutex<Vec<RequestSnapshot>>,
}

impl Rule {
    fn new(id: usize, spec: RuleSpec) -> Self {
        Rule {
            id,
            priority: spec.priority,
            matchers: spec.matchers,
            steps: spec.steps,
            completion: spec.completion,
            handled: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn steps(&self) -> &[Box<dyn Step>] {
        &self.steps
    }

    pub fn handled_count(&self) -> u64 {
        self.handled.load(Ordering::SeqCst)
    }

    /// All matchers must hold. A failing matcher (e.g. an unreadable body)
    /// counts as no match rather than an error for the whole request.
    pub async fn matches(&self, req: &OngoingRequest) -> bool {
        for matcher in &self.matchers {
            match matcher.matches(req).await {
                Ok(true) => continue,
                Ok(false) => return false,
                Err(err) => {
                    log::debug!("matcher error treated as no match: {}", err);
                    return false;
                }
            }
        }
        true
    }

    /// `Some(true)`: exhausted. `Some(false)`: available. `None`: no checker
    /// and already used, so only the list-position heuristic can decide.
    pub fn is_complete(&self) -> Option<bool> {
        match self.completion.limit() {
            Some(limit) => Some(self.handled_count() >= limit),
            None => match self.completion {
                CompletionPolicy::Always => Some(false),
                _ => {
                    if self.handled_count() == 0 {
                        Some(false)
                    } else {
                        None
                    }
                }
            },
        }
    }

    /// True while the rule still expects requests.
    pub fn is_pending(&self) -> bool {
        match self.completion.limit() {
            Some(limit) => self.handled_count() < limit,
            None => self.handled_count() == 0,
        }
    }

    /// Called once per successfully dispatched request, after the terminal
    /// step ran. The atomic increment is what keeps concurrent requests from
    /// both claiming the last slot of an N-times rule.
    pub fn record_handled(&self, snapshot: RequestSnapshot) {
        self.handled.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(snapshot);
    }

    pub fn seen_requests(&self) -> Vec<RequestSnapshot> {
        self.seen.lock().unwrap().clone()
    }

    pub fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            for step in &self.steps {
                step.dispose();
            }
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn explain(&self) -> String {
        let matcher_text: Vec<String> = self.matchers.iter().map(|m| m.explain()).collect();
        let step_text: Vec<String> = self.steps.iter().map(|s| s.explain()).collect();
        format!(
            "Match requests {}, and then {}",
            matcher_text.join(", "),
            step_text.join(", then ")
        )
    }
}

/// Handle onto a registered rule, handed back from `set_rules`/`add_rules`.
#[derive(Clone)]
pub struct MockedEndpoint {
    rule: Arc<Rule>,
}

impl MockedEndpoint {
    pub(crate) fn new(rule: Arc<Rule>) -> Self {
        MockedEndpoint { rule }
    }

    pub fn id(&self) -> usize {
        self.rule.id()
    }

    pub fn hits(&self) -> u64 {
        self.rule.handled_count()
    }

    pub fn is_pending(&self) -> bool {
        self.rule.is_pending()
    }

    pub fn seen_requests(&self) -> Vec<RequestSnapshot> {
        self.rule.seen_requests()
    }

    pub fn explain(&self) -> String {
        self.rule.explain()
    }
}

/// The ordered rule list of one server. Guarded by a single lock; matching
/// itself runs on a snapshot outside the lock.
pub struct RuleSet {
    rules: Mutex<Vec<Arc<Rule>>>,
    next_id: AtomicUsize,
}

impl RuleSet {
    pub fn new() -> Self {
        RuleSet {
            rules: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }

    pub fn add(&self, specs: Vec<RuleSpec>) -> Vec<Arc<Rule>> {
        let mut created = Vec::with_capacity(specs.len());
        let mut rules = self.rules.lock().unwrap();
        for spec in specs {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            log::debug!("adding rule with id={}", id);
            let rule = Arc::new(Rule::new(id, spec));
            rules.push(rule.clone());
            created.push(rule);
        }
        created
    }

    /// Replaces the whole list atomically, disposing the previous rules.
    pub fn set(&self, specs: Vec<RuleSpec>) -> Vec<Arc<Rule>> {
        let mut staged = Vec::with_capacity(specs.len());
        for spec in specs {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            staged.push(Arc::new(Rule::new(id, spec)));
        }

        let previous = {
            let mut rules = self.rules.lock().unwrap();
            std::mem::replace(&mut *rules, staged.clone())
        };
        for rule in previous {
            rule.dispose();
        }
        staged
    }

    pub fn reset(&self) {
        let previous = {
            let mut rules = self.rules.lock().unwrap();
            std::mem::take(&mut *rules)
        };
        log::trace!("disposing {} rules", previous.len());
        for rule in previous {
            rule.dispose();
        }
    }

    pub fn all(&self) -> Vec<Arc<Rule>> {
        self.rules.lock().unwrap().clone()
    }

    /// Picks the rule handling `req`, or `None` if nothing matches.
    ///
    /// Matchers run concurrently but their results are consumed in list
    /// order: the first matching, non-complete rule wins; failing that, the
    /// last matching rule with no completion checker that has already been
    /// used repeats.
    pub async fn select(&self, req: &OngoingRequest) -> Option<Arc<Rule>> {
        let mut rules = self.all();
        // Stable: ties keep insertion order.
        rules.sort_by_key(|rule| std::cmp::Reverse(rule.priority()));

        let matches = join_all(rules.iter().map(|rule| rule.matches(req))).await;

        for (rule, matched) in rules.iter().zip(matches.iter()) {
            if *matched && rule.is_complete() == Some(false) {
                return Some(rule.clone());
            }
        }

        for (rule, matched) in rules.iter().zip(matches.iter()).rev() {
            if *matched && rule.is_complete().is_none() {
                return Some(rule.clone());
            }
        }

        None
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        RuleSet::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::data::{CompletionPolicy, MatcherConfig};
    use crate::server::intake::OngoingRequest;
    use crate::server::rules::steps::ReplyStep;
    use bytes::Bytes;
    use http::Method;

    fn test_request(path: &str) -> OngoingRequest {
        OngoingRequest::synthetic(
            Method::GET,
            url::Url::parse(&format!("http://localhost{}", path)).unwrap(),
            vec![],
            Bytes::new(),
        )
    }

    fn spec(path: &str, completion: CompletionPolicy) -> RuleSpec {
        RuleSpec {
            priority: 0,
            matchers: vec![matchers::from_config(MatcherConfig::Path {
                path: path.to_string(),
            })],
            steps: vec![Box::new(ReplyStep::text(200, "ok"))],
            completion,
        }
    }

    #[tokio::test]
    async fn first_matching_incomplete_rule_wins() {
        let rules = RuleSet::new();
        rules.add(vec![
            spec("/a", CompletionPolicy::Unset),
            spec("/a", CompletionPolicy::Unset),
        ]);

        let selected = rules.select(&test_request("/a")).await.unwrap();

        assert_eq!(selected.id(), 0);
    }

    #[tokio::test]
    async fn once_rule_falls_through_after_first_use() {
        let rules = RuleSet::new();
        let created = rules.add(vec![
            spec("/a", CompletionPolicy::Once),
            spec("/a", CompletionPolicy::Unset),
        ]);

        let first = rules.select(&test_request("/a")).await.unwrap();
        assert_eq!(first.id(), 0);
        created[0].record_handled(test_request("/a").snapshot());

        let second = rules.select(&test_request("/a")).await.unwrap();
        assert_eq!(second.id(), 1);
    }

    #[tokio::test]
    async fn last_checkerless_rule_repeats_forever() {
        let rules = RuleSet::new();
        let created = rules.add(vec![spec("/a", CompletionPolicy::Unset)]);

        let first = rules.select(&test_request("/a")).await.unwrap();
        created[0].record_handled(test_request("/a").snapshot());

        // Used and checkerless, but nothing later matches, so it repeats.
        let again = rules.select(&test_request("/a")).await.unwrap();
        assert_eq!(first.id(), again.id());
    }

    #[tokio::test]
    async fn exhausted_once_rule_with_no_fallback_matches_nothing() {
        let rules = RuleSet::new();
        let created = rules.add(vec![spec("/a", CompletionPolicy::Once)]);
        created[0].record_handled(test_request("/a").snapshot());

        assert!(rules.select(&test_request("/a")).await.is_none());
    }

    #[tokio::test]
    async fn priority_orders_before_insertion() {
        let rules = RuleSet::new();
        let mut low = spec("/a", CompletionPolicy::Unset);
        low.priority = 0;
        let mut high = spec("/a", CompletionPolicy::Unset);
        high.priority = 10;
        rules.add(vec![low]);
        let high_rules = rules.add(vec![high]);

        let selected = rules.select(&test_request("/a")).await.unwrap();

        assert_eq!(selected.id(), high_rules[0].id());
    }

    #[tokio::test]
    async fn set_rules_disposes_previous() {
        let rules = RuleSet::new();
        let old = rules.add(vec![spec("/a", CompletionPolicy::Unset)]);

        rules.set(vec![spec("/b", CompletionPolicy::Unset)]);

        assert!(old[0].is_disposed());
        assert!(rules.select(&test_request("/a")).await.is_none());
        assert!(rules.select(&test_request("/b")).await.is_some());
    }
}
