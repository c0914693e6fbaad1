use std::collections::{HashMap, HashSet};

use serde_json::Value;
use uuid::Uuid;

use crate::{TaskDefinition, TaskId, TaskloomError, find_cycle};

/// A named set of tasks and the dependency edges between them.
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    id: String,
    name: String,
    tasks: Vec<TaskDefinition>,
    metadata: HashMap<String, Value>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            tasks: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metadata(&self) -> &HashMap<String, Value> {
        &self.metadata
    }

    pub fn tasks(&self) -> &[TaskDefinition] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Look a task up by id or name.
    pub fn get_task(&self, key: &str) -> Option<&TaskDefinition> {
        self.tasks.iter().find(|t| t.answers_to(key))
    }

    /// Append a task and return its id.
    ///
    /// Dependencies may name tasks that are added later; they are resolved
    /// when the execution order is computed. Ids and names share one
    /// namespace, so a task may not reuse another task's id or name.
    pub fn add_task(&mut self, task: TaskDefinition) -> Result<TaskId, TaskloomError> {
        if let Some(existing) = self
            .tasks
            .iter()
            .find(|t| t.answers_to(task.id()) || t.answers_to(task.name()))
        {
            return Err(TaskloomError::DuplicateTask(format!(
                "{} (conflicts with task {} / {})",
                task.name(),
                existing.name(),
                existing.id()
            )));
        }

        let id = task.id().to_string();
        self.tasks.push(task);
        Ok(id)
    }

    /// Chained form of [`add_task`](Self::add_task).
    pub fn task(mut self, task: TaskDefinition) -> Result<Self, TaskloomError> {
        self.add_task(task)?;
        Ok(self)
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.tasks.iter().position(|t| t.answers_to(key))
    }

    /// Check that every dependency resolves to a task of this workflow.
    pub fn validate(&self) -> Result<(), TaskloomError> {
        for task in &self.tasks {
            for dep in task.dependencies() {
                if self.position(dep).is_none() {
                    return Err(TaskloomError::UnknownDependency {
                        task: task.name().to_string(),
                        dependency: dep.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Group tasks into levels: every task's dependencies sit in strictly
    /// earlier levels. Tasks inside a level keep definition order and may run
    /// concurrently.
    pub fn get_execution_order(&self) -> Result<Vec<Vec<&TaskDefinition>>, TaskloomError> {
        self.validate()?;

        let n = self.tasks.len();
        let mut in_degrees = vec![0usize; n];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];

        for (idx, task) in self.tasks.iter().enumerate() {
            // A dependency listed by both id and name is still one edge.
            let deps: HashSet<usize> = task
                .dependencies()
                .iter()
                .filter_map(|dep| self.position(dep))
                .collect();
            in_degrees[idx] = deps.len();
            for dep in deps {
                dependents[dep].push(idx);
            }
        }

        let mut levels = Vec::new();
        let mut placed = 0;
        let mut current: Vec<usize> = (0..n).filter(|&i| in_degrees[i] == 0).collect();

        while !current.is_empty() {
            let mut next = Vec::new();
            for &idx in &current {
                for &child in &dependents[idx] {
                    in_degrees[child] -= 1;
                    if in_degrees[child] == 0 {
                        next.push(child);
                    }
                }
            }
            next.sort_unstable();

            placed += current.len();
            levels.push(current.iter().map(|&i| &self.tasks[i]).collect());
            current = next;
        }

        if placed < n {
            return Err(TaskloomError::CircularDependency {
                cycle: self.describe_cycle(&in_degrees),
            });
        }

        Ok(levels)
    }

    fn describe_cycle(&self, in_degrees: &[usize]) -> Vec<String> {
        let stuck: Vec<&TaskDefinition> = self
            .tasks
            .iter()
            .zip(in_degrees)
            .filter(|(_, degree)| **degree > 0)
            .map(|(task, _)| task)
            .collect();

        let graph: HashMap<String, Vec<String>> = stuck
            .iter()
            .map(|task| {
                let deps = task
                    .dependencies()
                    .iter()
                    .filter_map(|dep| self.get_task(dep))
                    .map(|dep| dep.name().to_string())
                    .collect();
                (task.name().to_string(), deps)
            })
            .collect();

        find_cycle(&graph)
            .unwrap_or_else(|| stuck.iter().map(|t| t.name().to_string()).collect())
    }
}
