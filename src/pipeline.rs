use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::File;
use std::io::BufReader;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::KiraError;
use crate::store::{ArtifactStore, ArtifactWriter};

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// Stage body: reads its dependencies through `StageInputs` and writes its own artifact.
pub type StageBody = Box<dyn Fn(&StageInputs<'_>, &mut ArtifactWriter) -> Result<(), KiraError>>;

pub struct Stage {
    id: String,
    artifact: String,
    deps: Vec<String>,
    body: StageBody,
}

impl Stage {
    pub fn new<F>(id: &str, artifact: &str, body: F) -> Self
    where
        F: Fn(&StageInputs<'_>, &mut ArtifactWriter) -> Result<(), KiraError> + 'static,
    {
        Self {
            id: id.to_string(),
            artifact: artifact.to_string(),
            deps: Vec::new(),
            body: Box::new(body),
        }
    }

    pub fn after(mut self, deps: &[&str]) -> Self {
        self.deps.extend(deps.iter().map(|dep| dep.to_string()));
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn artifact(&self) -> &str {
        &self.artifact
    }

    pub fn deps(&self) -> &[String] {
        &self.deps
    }
}

/// Read access to the artifacts of a stage's declared dependencies, by stage id.
pub struct StageInputs<'a> {
    store: &'a ArtifactStore,
    stage: &'a str,
    artifacts: HashMap<&'a str, &'a str>,
}

impl StageInputs<'_> {
    fn artifact(&self, dep: &str) -> Result<&str, KiraError> {
        self.artifacts.get(dep).copied().ok_or_else(|| {
            KiraError::UnknownStage(format!("{dep} (not a dependency of {})", self.stage))
        })
    }

    pub fn open(&self, dep: &str) -> Result<BufReader<File>, KiraError> {
        self.store.open_for_read(self.artifact(dep)?)
    }

    pub fn lines(&self, dep: &str) -> Result<Vec<String>, KiraError> {
        self.store.read_lines(self.artifact(dep)?)
    }

    pub fn for_each_line<F>(&self, dep: &str, visit: F) -> Result<(), KiraError>
    where
        F: FnMut(&str) -> Result<(), KiraError>,
    {
        self.store.for_each_line(self.artifact(dep)?, visit)
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self, dep: &str) -> Result<T, KiraError> {
        self.store.read_json(self.artifact(dep)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StageState {
    Pending,
    Running,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageOutcome {
    Skipped,
    Executed,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: String,
    pub artifact: String,
    pub outcome: StageOutcome,
    pub elapsed_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub started_at: String,
    pub finished_at: String,
    pub stages: Vec<StageReport>,
}

impl RunReport {
    pub fn executed(&self) -> usize {
        self.stages
            .iter()
            .filter(|report| report.outcome == StageOutcome::Executed)
            .count()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageStatus {
    pub stage: String,
    pub artifact: String,
    pub path: String,
    pub deps: Vec<String>,
    pub state: StageState,
}

/// DAG of stages memoized on their artifacts.
///
/// A stage whose artifact exists is complete and never re-run. Stages execute
/// one at a time in dependency order; the first failure stops the run and
/// leaves every committed artifact in place.
pub struct Pipeline {
    store: ArtifactStore,
    stages: Vec<Stage>,
    index: HashMap<String, usize>,
}

impl Pipeline {
    pub fn new(store: ArtifactStore) -> Self {
        Self {
            store,
            stages: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn add_stage(&mut self, stage: Stage) -> Result<(), KiraError> {
        if self.index.contains_key(&stage.id) {
            return Err(KiraError::DuplicateStage(stage.id));
        }
        if let Some(other) = self.stages.iter().find(|s| s.artifact == stage.artifact) {
            return Err(KiraError::DuplicateStage(format!(
                "{} (artifact {} already produced by {})",
                stage.id, stage.artifact, other.id
            )));
        }
        self.index.insert(stage.id.clone(), self.stages.len());
        self.stages.push(stage);
        Ok(())
    }

    /// Checks that every dependency is declared and the graph is acyclic.
    pub fn validate(&self) -> Result<(), KiraError> {
        self.plan(&[]).map(|_| ())
    }

    /// Topological order of `targets` and everything they depend on.
    /// Empty `targets` plans every stage. Ties keep registration order.
    pub fn plan(&self, targets: &[String]) -> Result<Vec<&str>, KiraError> {
        let mut wanted = HashSet::new();
        let mut stack: Vec<usize> = if targets.is_empty() {
            (0..self.stages.len()).collect()
        } else {
            targets
                .iter()
                .map(|target| self.lookup(target))
                .collect::<Result<_, _>>()?
        };
        while let Some(idx) = stack.pop() {
            if !wanted.insert(idx) {
                continue;
            }
            for dep in &self.stages[idx].deps {
                stack.push(self.lookup(dep)?);
            }
        }

        let mut pending: HashMap<usize, usize> = HashMap::new();
        let mut dependents: HashMap<usize, Vec<usize>> = HashMap::new();
        for &idx in &wanted {
            let stage = &self.stages[idx];
            pending.insert(idx, stage.deps.len());
            for dep in &stage.deps {
                dependents.entry(self.lookup(dep)?).or_default().push(idx);
            }
        }

        let mut ready: VecDeque<usize> = (0..self.stages.len())
            .filter(|idx| pending.get(idx) == Some(&0))
            .collect();
        let mut order = Vec::with_capacity(wanted.len());
        while let Some(idx) = ready.pop_front() {
            order.push(idx);
            let mut unlocked = Vec::new();
            for &next in dependents.get(&idx).into_iter().flatten() {
                if let Some(count) = pending.get_mut(&next) {
                    *count -= 1;
                    if *count == 0 {
                        unlocked.push(next);
                    }
                }
            }
            unlocked.sort_unstable();
            ready.extend(unlocked);
        }

        if order.len() != wanted.len() {
            let mut stuck: Vec<usize> = wanted
                .into_iter()
                .filter(|idx| !order.contains(idx))
                .collect();
            stuck.sort_unstable();
            return Err(KiraError::DependencyCycle(
                stuck.into_iter().map(|idx| self.stages[idx].id.clone()).collect(),
            ));
        }
        Ok(order.into_iter().map(|idx| self.stages[idx].id.as_str()).collect())
    }

    fn lookup(&self, id: &str) -> Result<usize, KiraError> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| KiraError::UnknownStage(id.to_string()))
    }

    fn state_of(&self, stage: &Stage) -> StageState {
        if self.store.exists(&stage.artifact) {
            StageState::Complete
        } else {
            StageState::Pending
        }
    }

    /// Completion state of every stage, in dependency order. Nothing is run.
    pub fn status(&self) -> Result<Vec<StageStatus>, KiraError> {
        let order = self.plan(&[])?;
        order
            .into_iter()
            .map(|id| {
                let stage = &self.stages[self.lookup(id)?];
                Ok(StageStatus {
                    stage: stage.id.clone(),
                    artifact: stage.artifact.clone(),
                    path: self.store.path(&stage.artifact).to_string(),
                    deps: stage.deps.clone(),
                    state: self.state_of(stage),
                })
            })
            .collect()
    }

    pub fn run(&self, targets: &[String], sink: &dyn ProgressSink) -> Result<RunReport, KiraError> {
        let order = self.plan(targets)?;
        sink.event(ProgressEvent {
            message: format!(
                "phase=Resolve; {} stages planned under {}",
                order.len(),
                self.store.root()
            ),
            elapsed: None,
        });
        self.store.ensure_root()?;

        let mut states: HashMap<&str, StageState> = HashMap::new();
        let mut report = RunReport {
            started_at: timestamp(),
            ..RunReport::default()
        };
        for id in order {
            let stage = &self.stages[self.lookup(id)?];
            if self.state_of(stage) == StageState::Complete {
                tracing::info!(stage = %stage.id, artifact = %stage.artifact, "artifact present, skipping");
                sink.event(ProgressEvent {
                    message: format!("phase=Skip; stage {}", stage.id),
                    elapsed: None,
                });
                states.insert(id, StageState::Complete);
                report.stages.push(StageReport {
                    stage: stage.id.clone(),
                    artifact: stage.artifact.clone(),
                    outcome: StageOutcome::Skipped,
                    elapsed_ms: None,
                });
                continue;
            }

            if let Some(dep) = stage
                .deps
                .iter()
                .find(|dep| states.get(dep.as_str()) != Some(&StageState::Complete))
            {
                return Err(KiraError::StageFailed {
                    stage: stage.id.clone(),
                    source: Box::new(KiraError::ArtifactNotFound(dep.clone())),
                });
            }

            states.insert(id, StageState::Running);
            tracing::info!(stage = %stage.id, artifact = %stage.artifact, "running stage");
            sink.event(ProgressEvent {
                message: format!("phase=Run; stage {}", stage.id),
                elapsed: None,
            });
            let start = Instant::now();
            match self.execute(stage) {
                Ok(()) => {
                    let elapsed = start.elapsed();
                    states.insert(id, StageState::Complete);
                    tracing::info!(stage = %stage.id, elapsed_ms = elapsed.as_millis() as u64, "stage complete");
                    sink.event(ProgressEvent {
                        message: format!("phase=Done; stage {}", stage.id),
                        elapsed: Some(elapsed),
                    });
                    report.stages.push(StageReport {
                        stage: stage.id.clone(),
                        artifact: stage.artifact.clone(),
                        outcome: StageOutcome::Executed,
                        elapsed_ms: Some(elapsed.as_millis() as u64),
                    });
                }
                Err(err) => {
                    states.insert(id, StageState::Failed);
                    tracing::error!(stage = %stage.id, error = %err, "stage failed");
                    sink.event(ProgressEvent {
                        message: format!("phase=Fail; stage {}: {err}", stage.id),
                        elapsed: Some(start.elapsed()),
                    });
                    return Err(KiraError::StageFailed {
                        stage: stage.id.clone(),
                        source: Box::new(err),
                    });
                }
            }
        }
        report.finished_at = timestamp();
        Ok(report)
    }

    fn execute(&self, stage: &Stage) -> Result<(), KiraError> {
        let artifacts = stage
            .deps
            .iter()
            .map(|dep| {
                let idx = self.lookup(dep)?;
                Ok((dep.as_str(), self.stages[idx].artifact.as_str()))
            })
            .collect::<Result<HashMap<_, _>, KiraError>>()?;
        let inputs = StageInputs {
            store: &self.store,
            stage: &stage.id,
            artifacts,
        };
        let mut writer = self.store.open_for_write(&stage.artifact)?;
        (stage.body)(&inputs, &mut writer)?;
        writer.commit()
    }
}

fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}
