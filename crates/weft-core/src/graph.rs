//! Execution graph built from a plan's task list.
//!
//! Design:
//! - Forward edges: task -> tasks it depends on (parents)
//! - Reverse edges: task -> tasks it unlocks (children)
//! - Both are indexed by declared position, so every traversal that yields
//!   tasks yields them in declared order.
//!
//! Cycle detection uses Kahn's algorithm: if the topological pass processes
//! fewer nodes than exist, the leftovers contain a cycle.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::domain::{PlanningError, TaskId, TaskSpec};

#[derive(Debug, Clone)]
pub struct ExecutionGraph {
    order: Vec<TaskId>,
    index: HashMap<TaskId, usize>,
    parents: Vec<Vec<usize>>,
    children: Vec<Vec<usize>>,
    ready: Vec<TaskId>,
}

impl ExecutionGraph {
    /// Validates `specs` and builds the graph.
    ///
    /// Errors, checked in this order: empty plan, duplicate ids, unknown
    /// dependencies (first offender in declared order), cycles.
    pub fn build(specs: &[TaskSpec]) -> Result<Self, PlanningError> {
        if specs.is_empty() {
            return Err(PlanningError::EmptyPlan);
        }

        let mut index = HashMap::with_capacity(specs.len());
        for (i, spec) in specs.iter().enumerate() {
            if index.insert(spec.id.clone(), i).is_some() {
                return Err(PlanningError::DuplicateTask(spec.id.clone()));
            }
        }

        let mut parents = vec![Vec::new(); specs.len()];
        let mut children = vec![Vec::new(); specs.len()];
        for (i, spec) in specs.iter().enumerate() {
            let mut seen = HashSet::new();
            for dep in &spec.deps {
                let Some(&p) = index.get(dep) else {
                    return Err(PlanningError::UnknownDependency {
                        task: spec.id.clone(),
                        missing: dep.clone(),
                    });
                };
                // 同じ依存を二重に書いても in-degree は 1
                if seen.insert(p) {
                    parents[i].push(p);
                    children[p].push(i);
                }
            }
        }
        for list in &mut children {
            list.sort_unstable();
        }

        let order: Vec<TaskId> = specs.iter().map(|s| s.id.clone()).collect();
        let ready = topo_check(&order, &parents, &children)?;

        Ok(Self {
            order,
            index,
            parents,
            children,
            ready,
        })
    }

    /// Tasks in declared order.
    pub fn tasks(&self) -> &[TaskId] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, task: &TaskId) -> bool {
        self.index.contains_key(task)
    }

    /// Initial ready set: tasks with in-degree zero, in declared order.
    pub fn ready(&self) -> &[TaskId] {
        &self.ready
    }

    pub fn in_degree(&self, task: &TaskId) -> usize {
        self.index
            .get(task)
            .map(|&i| self.parents[i].len())
            .unwrap_or(0)
    }

    pub fn parents_of(&self, task: &TaskId) -> Vec<&TaskId> {
        self.lookup(task, &self.parents)
    }

    /// Tasks that wait for `task`, in declared order.
    pub fn children_of(&self, task: &TaskId) -> Vec<&TaskId> {
        self.lookup(task, &self.children)
    }

    /// Number of parents of `task` that are not completed yet.
    pub fn remaining_in_degree(&self, task: &TaskId, is_completed: impl Fn(&TaskId) -> bool) -> usize {
        self.parents_of(task)
            .into_iter()
            .filter(|p| !is_completed(p))
            .count()
    }

    /// Children of `completed` whose every parent is now completed.
    ///
    /// Derived from the completion predicate, so asking twice for the same
    /// completion returns the same set and admits nothing new.
    pub fn unlocked_by(&self, completed: &TaskId, is_completed: impl Fn(&TaskId) -> bool) -> Vec<TaskId> {
        self.children_of(completed)
            .into_iter()
            .filter(|child| self.remaining_in_degree(child, &is_completed) == 0)
            .cloned()
            .collect()
    }

    /// Every task transitively downstream of `task`, in declared order.
    pub fn descendants(&self, task: &TaskId) -> Vec<TaskId> {
        let Some(&start) = self.index.get(task) else {
            return Vec::new();
        };
        let mut seen = vec![false; self.order.len()];
        let mut queue = VecDeque::from([start]);
        while let Some(node) = queue.pop_front() {
            for &child in &self.children[node] {
                if !seen[child] {
                    seen[child] = true;
                    queue.push_back(child);
                }
            }
        }
        seen.iter()
            .enumerate()
            .filter(|&(_, &s)| s)
            .map(|(i, _)| self.order[i].clone())
            .collect()
    }

    fn lookup<'a>(&'a self, task: &TaskId, edges: &'a [Vec<usize>]) -> Vec<&'a TaskId> {
        self.index
            .get(task)
            .map(|&i| edges[i].iter().map(|&j| &self.order[j]).collect())
            .unwrap_or_default()
    }
}

/// Kahn's algorithm. Returns the initial ready set, or the first task found
/// on a cycle.
fn topo_check(
    order: &[TaskId],
    parents: &[Vec<usize>],
    children: &[Vec<usize>],
) -> Result<Vec<TaskId>, PlanningError> {
    let mut remaining: Vec<usize> = parents.iter().map(Vec::len).collect();
    let ready: Vec<TaskId> = (0..order.len())
        .filter(|&i| remaining[i] == 0)
        .map(|i| order[i].clone())
        .collect();

    let mut queue: VecDeque<usize> = (0..order.len()).filter(|&i| remaining[i] == 0).collect();
    let mut processed = 0;
    while let Some(node) = queue.pop_front() {
        processed += 1;
        for &child in &children[node] {
            remaining[child] -= 1;
            if remaining[child] == 0 {
                queue.push_back(child);
            }
        }
    }

    if processed == order.len() {
        return Ok(ready);
    }

    // 未処理ノードは必ず未処理の親を持つので、親をたどると必ずどこかで
    // 同じノードに戻ってくる。最初に再訪したノードがサイクル上にある。
    let Some(mut node) = (0..order.len()).find(|&i| remaining[i] > 0) else {
        return Ok(ready);
    };
    let mut visited = vec![false; order.len()];
    while !visited[node] {
        visited[node] = true;
        match parents[node].iter().find(|&&p| remaining[p] > 0) {
            Some(&p) => node = p,
            None => break,
        }
    }
    Err(PlanningError::CyclicDependency {
        task: order[node].clone(),
    })
}
