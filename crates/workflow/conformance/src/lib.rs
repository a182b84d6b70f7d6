//! Conformance suite for workflow persistence providers
//!
//! Any [`PersistenceProvider`] proves it honours the storage contract by
//! running this suite against a fresh instance of itself.
//!
//! # Properties
//!
//! 1. **Create assigns identity** - a new record gets a unique id and the initial version
//! 2. **Read after create** - the stored record equals the input apart from id and version
//! 3. **Persist round-trip** - a persisted record reads back with its version advanced by one
//! 4. **Copy on read** - mutating returned or submitted values never changes stored state
//! 5. **Not found** - unknown ids are reported, never invented
//! 6. **Concurrent isolation** - independent create/persist sequences all succeed
//! 7. **Conflict detection** - of two writers on the same version exactly one wins
//! 8. **Version monotonicity** - successful persists step the version by exactly one
//! 9. **Runnable snapshot** - only due, runnable records are listed and nothing is written
//!
//! # Usage
//!
//! ```rust,ignore
//! use workflow_persistence::InMemoryPersistenceProvider;
//! use workflow_persistence_conformance::{ConformanceConfig, ConformanceSuite};
//!
//! let suite = ConformanceSuite::new(InMemoryPersistenceProvider::new(), ConformanceConfig::default());
//! let report = suite.run_all().await;
//! println!("{}", report);
//! assert!(report.all_passed());
//! ```

#![deny(unsafe_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use workflow_persistence::{PersistenceError, PersistenceProvider};
use workflow_types::{
    ExecutionPointer, WorkflowDefinitionId, WorkflowInstance, WorkflowInstanceId, INITIAL_VERSION,
};

/// Conformance test errors.
#[derive(Debug, Error)]
pub enum ConformanceError {
    #[error("Property violated: {0}")]
    Violation(String),

    #[error("Provider error: {0}")]
    Provider(#[from] PersistenceError),

    #[error("Setup error: {0}")]
    SetupError(String),

    #[error("Timeout")]
    Timeout,
}

/// Result type for conformance operations.
pub type ConformanceResult<T> = Result<T, ConformanceError>;

type Details = HashMap<String, String>;

fn ensure(condition: bool, message: impl FnOnce() -> String) -> ConformanceResult<()> {
    if condition {
        Ok(())
    } else {
        Err(ConformanceError::Violation(message()))
    }
}

// ============================================================================
// Property Definitions
// ============================================================================

/// The properties every persistence provider must hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Property {
    /// #1: Create assigns identity
    CreateAssignsIdentity,
    /// #2: Read after create
    ReadAfterCreate,
    /// #3: Persist round-trip
    PersistRoundTrip,
    /// #4: Copy on read
    CopyOnRead,
    /// #5: Not found
    NotFound,
    /// #6: Concurrent isolation
    ConcurrentIsolation,
    /// #7: Conflict detection
    ConflictDetection,
    /// #8: Version monotonicity
    VersionMonotonicity,
    /// #9: Runnable snapshot
    RunnableSnapshot,
}

impl Property {
    /// Get the property number (1-9).
    pub fn number(&self) -> u8 {
        match self {
            Property::CreateAssignsIdentity => 1,
            Property::ReadAfterCreate => 2,
            Property::PersistRoundTrip => 3,
            Property::CopyOnRead => 4,
            Property::NotFound => 5,
            Property::ConcurrentIsolation => 6,
            Property::ConflictDetection => 7,
            Property::VersionMonotonicity => 8,
            Property::RunnableSnapshot => 9,
        }
    }

    /// Get the property name.
    pub fn name(&self) -> &'static str {
        match self {
            Property::CreateAssignsIdentity => "Create assigns identity",
            Property::ReadAfterCreate => "Read after create",
            Property::PersistRoundTrip => "Persist round-trip",
            Property::CopyOnRead => "Copy on read",
            Property::NotFound => "Not found",
            Property::ConcurrentIsolation => "Concurrent isolation",
            Property::ConflictDetection => "Conflict detection",
            Property::VersionMonotonicity => "Version monotonicity",
            Property::RunnableSnapshot => "Runnable snapshot",
        }
    }

    /// Get all properties.
    pub fn all() -> Vec<Property> {
        vec![
            Property::CreateAssignsIdentity,
            Property::ReadAfterCreate,
            Property::PersistRoundTrip,
            Property::CopyOnRead,
            Property::NotFound,
            Property::ConcurrentIsolation,
            Property::ConflictDetection,
            Property::VersionMonotonicity,
            Property::RunnableSnapshot,
        ]
    }
}

impl std::fmt::Display for Property {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}: {}", self.number(), self.name())
    }
}

// ============================================================================
// Test Results
// ============================================================================

/// Status of a conformance test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestStatus {
    /// Test passed.
    Passed,
    /// Test failed.
    Failed,
    /// Test did not run due to error.
    Error,
}

/// A single test case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    /// Test name.
    pub name: String,
    /// Test description.
    pub description: String,
    /// The property being tested.
    pub property: Property,
    /// Test status.
    pub status: TestStatus,
    /// Duration in milliseconds.
    pub duration_ms: i64,
    /// Error message if failed.
    pub error: Option<String>,
    /// Additional details.
    pub details: Details,
}

/// A conformance test report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConformanceReport {
    /// Report timestamp.
    pub timestamp: DateTime<Utc>,
    /// Total duration in milliseconds.
    pub duration_ms: i64,
    /// All test cases.
    pub tests: Vec<TestCase>,
    /// Tests by property.
    pub by_property: HashMap<Property, Vec<TestCase>>,
    /// Summary statistics.
    pub summary: ReportSummary,
}

/// Summary of a conformance report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportSummary {
    /// Total number of tests.
    pub total: usize,
    /// Number passed.
    pub passed: usize,
    /// Number failed.
    pub failed: usize,
    /// Number of errors.
    pub errors: usize,
    /// Every property has at least one test and none of its tests failed.
    pub all_properties_verified: bool,
}

impl ConformanceReport {
    /// Create a new report from test results.
    pub fn new(tests: Vec<TestCase>, duration_ms: i64) -> Self {
        let mut by_property: HashMap<Property, Vec<TestCase>> = HashMap::new();
        for test in &tests {
            by_property
                .entry(test.property)
                .or_default()
                .push(test.clone());
        }

        let count = |status: TestStatus| tests.iter().filter(|t| t.status == status).count();
        let passed = count(TestStatus::Passed);
        let failed = count(TestStatus::Failed);
        let errors = count(TestStatus::Error);

        let all_properties_verified = Property::all().iter().all(|property| {
            by_property
                .get(property)
                .map(|tests| tests.iter().all(|t| t.status == TestStatus::Passed))
                .unwrap_or(false)
        });

        Self {
            timestamp: Utc::now(),
            duration_ms,
            tests,
            by_property,
            summary: ReportSummary {
                total: passed + failed + errors,
                passed,
                failed,
                errors,
                all_properties_verified,
            },
        }
    }

    /// Check if all tests passed.
    pub fn all_passed(&self) -> bool {
        self.summary.failed == 0 && self.summary.errors == 0
    }

    /// Tests that did not pass.
    pub fn failures(&self) -> impl Iterator<Item = &TestCase> {
        self.tests
            .iter()
            .filter(|t| matches!(t.status, TestStatus::Failed | TestStatus::Error))
    }
}

impl std::fmt::Display for ConformanceReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Workflow Persistence Conformance Report")?;
        writeln!(f, "=======================================")?;
        writeln!(
            f,
            "Timestamp: {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
        )?;
        writeln!(f, "Duration: {}ms", self.duration_ms)?;
        writeln!(f)?;

        writeln!(f, "Summary:")?;
        writeln!(f, "  Total: {}", self.summary.total)?;
        writeln!(f, "  Passed: {}", self.summary.passed)?;
        writeln!(f, "  Failed: {}", self.summary.failed)?;
        writeln!(f, "  Errors: {}", self.summary.errors)?;
        writeln!(f)?;

        writeln!(f, "Properties:")?;
        for property in Property::all() {
            let status = match self.by_property.get(&property) {
                Some(tests) if tests.iter().all(|t| t.status == TestStatus::Passed) => "✓",
                Some(tests)
                    if tests
                        .iter()
                        .any(|t| matches!(t.status, TestStatus::Failed | TestStatus::Error)) =>
                {
                    "✗"
                }
                _ => "○",
            };
            writeln!(f, "  {} {}", status, property)?;
        }

        let mut failures = self.failures().peekable();
        if failures.peek().is_some() {
            writeln!(f)?;
            writeln!(f, "Failures:")?;
            for test in failures {
                writeln!(
                    f,
                    "  {} ({}): {}",
                    test.name,
                    test.property,
                    test.error.as_deref().unwrap_or("unknown")
                )?;
            }
        }
        writeln!(f)?;

        if self.summary.all_properties_verified {
            writeln!(f, "Result: ALL PROPERTIES VERIFIED")?;
        } else {
            writeln!(f, "Result: SOME PROPERTIES NOT VERIFIED")?;
        }

        Ok(())
    }
}

// ============================================================================
// Test Configuration
// ============================================================================

/// Configuration for conformance tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConformanceConfig {
    /// Timeout for each test in milliseconds.
    pub test_timeout_ms: u64,
    /// Independent create/persist sequences launched at once.
    pub concurrent_sequences: usize,
    /// Rounds of two writers racing on one instance.
    pub contention_rounds: usize,
    /// Consecutive persists checked for monotonic versions.
    pub monotonic_persists: usize,
}

impl Default for ConformanceConfig {
    fn default() -> Self {
        Self {
            test_timeout_ms: 5000,
            concurrent_sequences: 30,
            contention_rounds: 10,
            monotonic_persists: 20,
        }
    }
}

// ============================================================================
// Fixtures
// ============================================================================

const FIXTURE_DEFINITION: &str = "My Workflow";
const MISSING_ID: &str = "conformance-never-created";

/// The instance every check starts from: a payload, a description, a due
/// schedule and one active pointer.
pub fn sample_instance() -> WorkflowInstance {
    let mut instance = WorkflowInstance::new(WorkflowDefinitionId::new(FIXTURE_DEFINITION))
        .with_description("My Description")
        .with_data(serde_json::json!({ "value1": 7 }))
        .with_next_execution(0);
    // A fresh set cannot already hold a generated id.
    let _ = instance.execution_pointers.add(ExecutionPointer::active(0));
    instance
}

/// The update every round-trip applies: reschedule and add a second pointer.
fn apply_update(instance: &mut WorkflowInstance) -> ConformanceResult<()> {
    instance.next_execution = Some(7);
    instance
        .execution_pointers
        .add(ExecutionPointer::active(1))
        .map_err(|e| ConformanceError::SetupError(e.to_string()))?;
    Ok(())
}

// ============================================================================
// Conformance Suite
// ============================================================================

/// The conformance suite, bound to one provider.
///
/// Checks create their own instances and only inspect those, so the
/// provider may already hold data.
pub struct ConformanceSuite<P> {
    provider: Arc<P>,
    config: ConformanceConfig,
}

impl<P> ConformanceSuite<P>
where
    P: PersistenceProvider + 'static,
{
    pub fn new(provider: P, config: ConformanceConfig) -> Self {
        Self::with_shared(Arc::new(provider), config)
    }

    pub fn with_shared(provider: Arc<P>, config: ConformanceConfig) -> Self {
        Self { provider, config }
    }

    pub fn config(&self) -> &ConformanceConfig {
        &self.config
    }

    /// Run all conformance tests.
    pub async fn run_all(&self) -> ConformanceReport {
        let start = Utc::now();
        let mut tests = Vec::new();

        for property in Property::all() {
            tests.extend(self.tests_for(property).await);
        }

        let duration_ms = (Utc::now() - start).num_milliseconds();
        let report = ConformanceReport::new(tests, duration_ms);
        tracing::info!(
            passed = report.summary.passed,
            failed = report.summary.failed,
            errors = report.summary.errors,
            "conformance run finished"
        );
        report
    }

    /// Run tests for a specific property.
    pub async fn run_for_property(&self, property: Property) -> ConformanceReport {
        let start = Utc::now();
        let tests = self.tests_for(property).await;
        let duration_ms = (Utc::now() - start).num_milliseconds();
        ConformanceReport::new(tests, duration_ms)
    }

    async fn tests_for(&self, property: Property) -> Vec<TestCase> {
        match property {
            Property::CreateAssignsIdentity => vec![
                self.run_case(
                    property,
                    "create_assigns_id_and_initial_version",
                    "Create on an unassigned id returns a fresh id and the initial version",
                    self.check_create_assigns(),
                )
                .await,
                self.run_case(
                    property,
                    "create_ids_are_distinct",
                    "Two creates never share an id",
                    self.check_distinct_ids(),
                )
                .await,
                self.run_case(
                    property,
                    "create_rejects_existing_id",
                    "Creating under a stored id fails with DuplicateId and stores nothing",
                    self.check_duplicate_rejected(),
                )
                .await,
            ],
            Property::ReadAfterCreate => vec![
                self.run_case(
                    property,
                    "get_after_create_matches_input",
                    "The stored record equals the input apart from id and version",
                    self.check_read_after_create(),
                )
                .await,
            ],
            Property::PersistRoundTrip => vec![
                self.run_case(
                    property,
                    "persist_then_get_matches",
                    "A persisted record reads back unchanged with version + 1",
                    self.check_persist_round_trip(),
                )
                .await,
                self.run_case(
                    property,
                    "stale_persist_leaves_state",
                    "A rejected persist changes neither the store nor the caller's version",
                    self.check_stale_persist_leaves_state(),
                )
                .await,
            ],
            Property::CopyOnRead => vec![
                self.run_case(
                    property,
                    "mutating_read_copy_leaves_store",
                    "Changing a returned instance does not change the stored one",
                    self.check_read_copy_isolated(),
                )
                .await,
                self.run_case(
                    property,
                    "mutating_input_after_create_leaves_store",
                    "Changing the submitted instance after create does not change the stored one",
                    self.check_input_copy_isolated(),
                )
                .await,
            ],
            Property::NotFound => vec![
                self.run_case(
                    property,
                    "get_unknown_id",
                    "Reading an id never created fails with NotFound",
                    self.check_get_unknown(),
                )
                .await,
                self.run_case(
                    property,
                    "persist_unknown_id",
                    "Persisting an id never created fails with NotFound",
                    self.check_persist_unknown(),
                )
                .await,
            ],
            Property::ConcurrentIsolation => vec![
                self.run_case(
                    property,
                    "concurrent_create_persist_sequences",
                    "Concurrent independent sequences all succeed and read back correctly",
                    self.check_concurrent_sequences(),
                )
                .await,
            ],
            Property::ConflictDetection => vec![
                self.run_case(
                    property,
                    "racing_persists_one_winner",
                    "Two writers from the same version: one wins, one conflicts, version + 1",
                    self.check_racing_writers(),
                )
                .await,
            ],
            Property::VersionMonotonicity => vec![
                self.run_case(
                    property,
                    "versions_step_by_one",
                    "Successive persists yield strictly increasing versions with step 1",
                    self.check_monotonic_versions(),
                )
                .await,
            ],
            Property::RunnableSnapshot => vec![
                self.run_case(
                    property,
                    "runnable_filters_status_and_time",
                    "Only runnable instances due at the cut-off are listed, earliest first",
                    self.check_runnable_filter(),
                )
                .await,
                self.run_case(
                    property,
                    "runnable_leaves_versions",
                    "Listing runnable instances writes nothing",
                    self.check_runnable_read_only(),
                )
                .await,
            ],
        }
    }

    async fn run_case<F>(
        &self,
        property: Property,
        name: &str,
        description: &str,
        check: F,
    ) -> TestCase
    where
        F: Future<Output = ConformanceResult<Details>>,
    {
        let start = Utc::now();
        let timeout = Duration::from_millis(self.config.test_timeout_ms);
        let outcome = match tokio::time::timeout(timeout, check).await {
            Ok(result) => result,
            Err(_) => Err(ConformanceError::Timeout),
        };
        let duration_ms = (Utc::now() - start).num_milliseconds();

        let (status, error, details) = match outcome {
            Ok(details) => (TestStatus::Passed, None, details),
            Err(err @ (ConformanceError::Violation(_) | ConformanceError::Provider(_))) => {
                (TestStatus::Failed, Some(err.to_string()), Details::new())
            }
            Err(err) => (TestStatus::Error, Some(err.to_string()), Details::new()),
        };

        if status != TestStatus::Passed {
            tracing::warn!(test = name, %property, error = ?error, "conformance test did not pass");
        }

        TestCase {
            name: name.to_string(),
            description: description.to_string(),
            property,
            status,
            duration_ms,
            error,
            details,
        }
    }

    async fn create_sample(&self) -> ConformanceResult<WorkflowInstance> {
        let mut instance = sample_instance();
        self.provider.create_new_workflow(&mut instance).await?;
        Ok(instance)
    }

    // ── #1 ───────────────────────────────────────────────────────────

    async fn check_create_assigns(&self) -> ConformanceResult<Details> {
        let mut instance = sample_instance();
        let id = self.provider.create_new_workflow(&mut instance).await?;

        ensure(!id.is_unassigned(), || "create returned an empty id".into())?;
        ensure(instance.id == id, || {
            format!("caller's instance carries {} instead of {id}", instance.id)
        })?;
        ensure(instance.version == INITIAL_VERSION, || {
            format!(
                "caller's instance has version {}, expected {INITIAL_VERSION}",
                instance.version
            )
        })?;

        Ok(HashMap::from([("id".to_string(), id.to_string())]))
    }

    async fn check_distinct_ids(&self) -> ConformanceResult<Details> {
        let a = self.create_sample().await?;
        let b = self.create_sample().await?;
        ensure(a.id != b.id, || format!("two creates returned {}", a.id))?;
        Ok(Details::new())
    }

    async fn check_duplicate_rejected(&self) -> ConformanceResult<Details> {
        let existing = self.create_sample().await?;

        let mut clash = sample_instance().with_description("clash");
        clash.id = existing.id.clone();
        match self.provider.create_new_workflow(&mut clash).await {
            Err(PersistenceError::DuplicateId(_)) => {}
            Err(other) => {
                return Err(ConformanceError::Violation(format!(
                    "expected DuplicateId, got {other}"
                )))
            }
            Ok(_) => {
                return Err(ConformanceError::Violation(
                    "create accepted an id that already exists".into(),
                ))
            }
        }

        let stored = self.provider.get_workflow_instance(&existing.id).await?;
        ensure(stored == existing, || {
            "rejected create changed the stored record".into()
        })?;
        Ok(Details::new())
    }

    // ── #2 ───────────────────────────────────────────────────────────

    async fn check_read_after_create(&self) -> ConformanceResult<Details> {
        let input = sample_instance();
        let mut submitted = input.clone();
        let id = self.provider.create_new_workflow(&mut submitted).await?;

        let stored = self.provider.get_workflow_instance(&id).await?;
        let mut expected = input;
        expected.id = id;
        expected.version = INITIAL_VERSION;

        ensure(stored == expected, || {
            format!("stored record differs from input: {stored:?}")
        })?;
        Ok(Details::new())
    }

    // ── #3 ───────────────────────────────────────────────────────────

    async fn check_persist_round_trip(&self) -> ConformanceResult<Details> {
        let mut instance = self.create_sample().await?;
        apply_update(&mut instance)?;
        let submitted = instance.clone();

        self.provider.persist_workflow(&mut instance).await?;

        let stored = self.provider.get_workflow_instance(&instance.id).await?;
        let mut expected = submitted.clone();
        expected.version = submitted.version + 1;

        ensure(stored == expected, || {
            format!("persisted record differs on read: {stored:?}")
        })?;
        ensure(instance.version == expected.version, || {
            format!(
                "caller's instance has version {}, store has {}",
                instance.version, expected.version
            )
        })?;
        Ok(HashMap::from([(
            "version".to_string(),
            stored.version.to_string(),
        )]))
    }

    async fn check_stale_persist_leaves_state(&self) -> ConformanceResult<Details> {
        let created = self.create_sample().await?;
        let mut winner = created.clone();
        let mut stale = created.clone();

        self.provider.persist_workflow(&mut winner).await?;
        let committed = self.provider.get_workflow_instance(&created.id).await?;

        stale.suspend();
        match self.provider.persist_workflow(&mut stale).await {
            Err(PersistenceError::ConcurrencyConflict { .. }) => {}
            Err(other) => {
                return Err(ConformanceError::Violation(format!(
                    "expected ConcurrencyConflict, got {other}"
                )))
            }
            Ok(()) => {
                return Err(ConformanceError::Violation(
                    "stale persist was accepted".into(),
                ))
            }
        }

        ensure(stale.version == created.version, || {
            format!("rejected persist moved caller's version to {}", stale.version)
        })?;
        let after = self.provider.get_workflow_instance(&created.id).await?;
        ensure(after == committed, || {
            "rejected persist changed the stored record".into()
        })?;
        Ok(Details::new())
    }

    // ── #4 ───────────────────────────────────────────────────────────

    async fn check_read_copy_isolated(&self) -> ConformanceResult<Details> {
        let created = self.create_sample().await?;
        let before = self.provider.get_workflow_instance(&created.id).await?;

        let mut copy = before.clone();
        copy.data = serde_json::json!({ "value1": 99 });
        copy.terminate();

        let after = self.provider.get_workflow_instance(&created.id).await?;
        ensure(after == before, || {
            "stored record changed after mutating a read copy".into()
        })?;
        Ok(Details::new())
    }

    async fn check_input_copy_isolated(&self) -> ConformanceResult<Details> {
        let mut instance = self.create_sample().await?;
        let before = self.provider.get_workflow_instance(&instance.id).await?;

        instance.data["value1"] = serde_json::json!(99);
        instance.execution_pointers.deactivate_all();

        let after = self.provider.get_workflow_instance(&instance.id).await?;
        ensure(after == before, || {
            "stored record changed after mutating the submitted instance".into()
        })?;
        Ok(Details::new())
    }

    // ── #5 ───────────────────────────────────────────────────────────

    async fn check_get_unknown(&self) -> ConformanceResult<Details> {
        let missing = WorkflowInstanceId::new(MISSING_ID);
        match self.provider.get_workflow_instance(&missing).await {
            Err(PersistenceError::NotFound(_)) => Ok(Details::new()),
            Err(other) => Err(ConformanceError::Violation(format!(
                "expected NotFound, got {other}"
            ))),
            Ok(_) => Err(ConformanceError::Violation(
                "read returned a record that was never created".into(),
            )),
        }
    }

    async fn check_persist_unknown(&self) -> ConformanceResult<Details> {
        let mut ghost = sample_instance();
        ghost.id = WorkflowInstanceId::new(MISSING_ID);
        ghost.version = INITIAL_VERSION;

        match self.provider.persist_workflow(&mut ghost).await {
            Err(PersistenceError::NotFound(_)) => {}
            Err(other) => {
                return Err(ConformanceError::Violation(format!(
                    "expected NotFound, got {other}"
                )))
            }
            Ok(()) => {
                return Err(ConformanceError::Violation(
                    "persist accepted an id that was never created".into(),
                ))
            }
        }

        match self.provider.get_workflow_instance(&ghost.id).await {
            Err(PersistenceError::NotFound(_)) => Ok(Details::new()),
            _ => Err(ConformanceError::Violation(
                "failed persist left a record behind".into(),
            )),
        }
    }

    // ── #6 ───────────────────────────────────────────────────────────

    async fn check_concurrent_sequences(&self) -> ConformanceResult<Details> {
        let sequences = self.config.concurrent_sequences;
        let handles: Vec<_> = (0..sequences)
            .map(|_| {
                let provider = Arc::clone(&self.provider);
                tokio::spawn(async move {
                    let mut instance = sample_instance();
                    provider.create_new_workflow(&mut instance).await?;
                    apply_update(&mut instance)?;
                    let submitted = instance.clone();
                    provider.persist_workflow(&mut instance).await?;
                    Ok::<_, ConformanceError>(submitted)
                })
            })
            .collect();

        let mut submitted = Vec::with_capacity(sequences);
        for joined in join_all(handles).await {
            let instance = joined.map_err(|e| ConformanceError::SetupError(e.to_string()))??;
            submitted.push(instance);
        }

        let mut ids: Vec<_> = submitted.iter().map(|i| i.id.clone()).collect();
        ids.sort();
        ids.dedup();
        ensure(ids.len() == sequences, || {
            format!("{sequences} sequences produced {} distinct ids", ids.len())
        })?;

        for instance in &submitted {
            let stored = self.provider.get_workflow_instance(&instance.id).await?;
            let mut expected = instance.clone();
            expected.version += 1;
            ensure(stored == expected, || {
                format!("instance {} read back incorrectly", instance.id)
            })?;
        }

        Ok(HashMap::from([(
            "sequences".to_string(),
            sequences.to_string(),
        )]))
    }

    // ── #7 ───────────────────────────────────────────────────────────

    async fn check_racing_writers(&self) -> ConformanceResult<Details> {
        let created = self.create_sample().await?;
        let rounds = self.config.contention_rounds;

        for round in 0..rounds {
            let base = self.provider.get_workflow_instance(&created.id).await?;
            let writers = (0..2).map(|writer| {
                let provider = Arc::clone(&self.provider);
                let mut copy = base.clone();
                copy.data = serde_json::json!({ "round": round, "writer": writer });
                tokio::spawn(async move { provider.persist_workflow(&mut copy).await })
            });

            let mut wins = 0;
            let mut conflicts = 0;
            for joined in join_all(writers).await {
                match joined.map_err(|e| ConformanceError::SetupError(e.to_string()))? {
                    Ok(()) => wins += 1,
                    Err(PersistenceError::ConcurrencyConflict { .. }) => conflicts += 1,
                    Err(other) => return Err(other.into()),
                }
            }
            ensure(wins == 1 && conflicts == 1, || {
                format!("round {round}: {wins} writers won, {conflicts} conflicted")
            })?;

            let after = self.provider.get_workflow_instance(&created.id).await?;
            ensure(after.version == base.version + 1, || {
                format!(
                    "round {round}: version moved from {} to {}",
                    base.version, after.version
                )
            })?;
        }

        Ok(HashMap::from([("rounds".to_string(), rounds.to_string())]))
    }

    // ── #8 ───────────────────────────────────────────────────────────

    async fn check_monotonic_versions(&self) -> ConformanceResult<Details> {
        let mut instance = self.create_sample().await?;
        let mut versions = vec![instance.version];

        for step in 0..self.config.monotonic_persists {
            instance.next_execution = Some(step as i64);
            self.provider.persist_workflow(&mut instance).await?;
            let stored = self.provider.get_workflow_instance(&instance.id).await?;
            versions.push(stored.version);
        }

        ensure(versions.windows(2).all(|w| w[1] == w[0] + 1), || {
            format!("versions did not step by one: {versions:?}")
        })?;
        Ok(HashMap::from([(
            "final_version".to_string(),
            versions.last().copied().unwrap_or_default().to_string(),
        )]))
    }

    // ── #9 ───────────────────────────────────────────────────────────

    async fn create_scheduled(
        &self,
        definition: &WorkflowDefinitionId,
        at: DateTime<Utc>,
        suspended: bool,
    ) -> ConformanceResult<WorkflowInstance> {
        let mut instance = WorkflowInstance::new(definition.clone());
        instance.schedule_at(at);
        if suspended {
            instance.suspend();
        }
        self.provider.create_new_workflow(&mut instance).await?;
        Ok(instance)
    }

    async fn check_runnable_filter(&self) -> ConformanceResult<Details> {
        let definition = WorkflowDefinitionId::new(format!(
            "runnable-{}",
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        let as_of = Utc::now();
        let minute = chrono::Duration::seconds(60);

        let late = self.create_scheduled(&definition, as_of, false).await?;
        let early = self.create_scheduled(&definition, as_of - minute, false).await?;
        self.create_scheduled(&definition, as_of + minute, false).await?;
        self.create_scheduled(&definition, as_of - minute, true).await?;
        let mut unscheduled = WorkflowInstance::new(definition.clone());
        self.provider.create_new_workflow(&mut unscheduled).await?;

        let listed: Vec<WorkflowInstanceId> = self
            .provider
            .get_runnable_instances(as_of)
            .await?
            .into_iter()
            .filter(|i| i.workflow_definition_id == definition)
            .map(|i| i.id)
            .collect();

        let expected = vec![early.id, late.id];
        ensure(listed == expected, || {
            format!("expected {expected:?}, listed {listed:?}")
        })?;
        Ok(Details::new())
    }

    async fn check_runnable_read_only(&self) -> ConformanceResult<Details> {
        let mut instance = sample_instance();
        instance.schedule_at(Utc::now() - chrono::Duration::seconds(1));
        self.provider.create_new_workflow(&mut instance).await?;

        let listed = self.provider.get_runnable_instances(Utc::now()).await?;
        ensure(listed.iter().any(|i| i.id == instance.id), || {
            format!("due instance {} was not listed", instance.id)
        })?;

        let stored = self.provider.get_workflow_instance(&instance.id).await?;
        ensure(stored.version == INITIAL_VERSION, || {
            format!("listing moved version to {}", stored.version)
        })?;
        Ok(Details::new())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use workflow_persistence::{InstanceFilter, PersistenceResult};

    /// Last writer wins, versions never move.
    #[derive(Default)]
    struct LastWriterWins {
        records: Mutex<HashMap<WorkflowInstanceId, WorkflowInstance>>,
    }

    #[async_trait]
    impl PersistenceProvider for LastWriterWins {
        async fn create_new_workflow(
            &self,
            instance: &mut WorkflowInstance,
        ) -> PersistenceResult<WorkflowInstanceId> {
            instance.id = WorkflowInstanceId::new(uuid::Uuid::new_v4().to_string());
            instance.version = INITIAL_VERSION;
            self.records
                .lock()
                .insert(instance.id.clone(), instance.clone());
            Ok(instance.id.clone())
        }

        async fn get_workflow_instance(
            &self,
            id: &WorkflowInstanceId,
        ) -> PersistenceResult<WorkflowInstance> {
            self.records
                .lock()
                .get(id)
                .cloned()
                .ok_or_else(|| PersistenceError::NotFound(id.clone()))
        }

        async fn persist_workflow(&self, instance: &mut WorkflowInstance) -> PersistenceResult<()> {
            let mut records = self.records.lock();
            match records.get_mut(&instance.id) {
                Some(stored) => {
                    *stored = instance.clone();
                    Ok(())
                }
                None => Err(PersistenceError::NotFound(instance.id.clone())),
            }
        }

        async fn get_runnable_instances(
            &self,
            as_of: DateTime<Utc>,
        ) -> PersistenceResult<Vec<WorkflowInstance>> {
            let mut due: Vec<_> = self
                .records
                .lock()
                .values()
                .filter(|i| i.is_due(as_of))
                .cloned()
                .collect();
            due.sort_by(|a, b| a.next_execution.cmp(&b.next_execution));
            Ok(due)
        }

        async fn get_workflow_instances(
            &self,
            ids: &[WorkflowInstanceId],
        ) -> PersistenceResult<Vec<WorkflowInstance>> {
            let records = self.records.lock();
            Ok(ids.iter().filter_map(|id| records.get(id).cloned()).collect())
        }

        async fn query_workflow_instances(
            &self,
            filter: &InstanceFilter,
        ) -> PersistenceResult<Vec<WorkflowInstance>> {
            Ok(self
                .records
                .lock()
                .values()
                .filter(|i| filter.matches(i))
                .cloned()
                .collect())
        }
    }

    fn small_config() -> ConformanceConfig {
        ConformanceConfig {
            concurrent_sequences: 4,
            contention_rounds: 2,
            monotonic_persists: 3,
            ..ConformanceConfig::default()
        }
    }

    #[test]
    fn test_property_enum() {
        assert_eq!(Property::CreateAssignsIdentity.number(), 1);
        assert_eq!(Property::ConflictDetection.number(), 7);
        assert_eq!(Property::RunnableSnapshot.number(), 9);
        assert_eq!(Property::all().len(), 9);
        assert_eq!(
            Property::NotFound.to_string(),
            "#5: Not found".to_string()
        );
    }

    #[test]
    fn test_sample_instance() {
        let instance = sample_instance();
        assert!(instance.id.is_unassigned());
        assert_eq!(instance.data["value1"], 7);
        assert_eq!(instance.execution_pointers.active().count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_last_writer_wins_is_caught() {
        let suite = ConformanceSuite::new(LastWriterWins::default(), small_config());
        let report = suite.run_all().await;
        println!("{}", report);

        assert!(!report.all_passed());
        assert!(!report.summary.all_properties_verified);

        let failed = |property: Property| {
            report.by_property[&property]
                .iter()
                .any(|t| t.status == TestStatus::Failed)
        };
        assert!(failed(Property::PersistRoundTrip));
        assert!(failed(Property::ConflictDetection));
        assert!(failed(Property::VersionMonotonicity));
        assert!(!failed(Property::ReadAfterCreate));
        assert!(!failed(Property::NotFound));
    }

    #[tokio::test]
    async fn test_run_for_property() {
        let suite = ConformanceSuite::new(LastWriterWins::default(), small_config());
        let report = suite.run_for_property(Property::NotFound).await;

        assert_eq!(report.tests.len(), 2);
        assert!(report.all_passed());
        assert!(report.tests.iter().all(|t| t.property == Property::NotFound));
    }

    #[test]
    fn test_report_summary() {
        let case = |name: &str, status: TestStatus| TestCase {
            name: name.to_string(),
            description: name.to_string(),
            property: Property::ConflictDetection,
            status,
            duration_ms: 1,
            error: (status != TestStatus::Passed).then(|| "Failed".to_string()),
            details: HashMap::new(),
        };

        let report = ConformanceReport::new(
            vec![
                case("test1", TestStatus::Passed),
                case("test2", TestStatus::Failed),
                case("test3", TestStatus::Error),
            ],
            15,
        );
        assert_eq!(report.summary.total, 3);
        assert_eq!(report.summary.passed, 1);
        assert_eq!(report.summary.failed, 1);
        assert_eq!(report.summary.errors, 1);
        assert_eq!(report.failures().count(), 2);
        assert!(!report.all_passed());

        let rendered = report.to_string();
        assert!(rendered.contains("✗ #7: Conflict detection"));
        assert!(rendered.contains("SOME PROPERTIES NOT VERIFIED"));
    }

    #[tokio::test]
    async fn test_every_case_is_counted() {
        let suite = ConformanceSuite::new(LastWriterWins::default(), small_config());
        let report = suite.run_all().await;

        let summary = &report.summary;
        assert_eq!(summary.total, report.tests.len());
        assert_eq!(
            summary.passed + summary.failed + summary.errors,
            report.tests.len()
        );
        assert_eq!(
            report.by_property.values().map(Vec::len).sum::<usize>(),
            report.tests.len()
        );
    }
}
