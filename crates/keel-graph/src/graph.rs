use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::GraphError;

/// Graph structure for dependency tracking.
///
/// Names are kept in `BTreeMap`s so every traversal is deterministic.
#[derive(Debug, Clone)]
pub struct Graph {
  /// Declared inputs: name -> ordered list of upstream names.
  inputs: BTreeMap<String, Vec<String>>,
  /// Reverse edges: name -> list of downstream names.
  dependents: BTreeMap<String, Vec<String>>,
  /// Inputs before dependents.
  start_order: Vec<String>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
  Visiting,
  Done,
}

impl Graph {
  /// Build and validate a graph from `(name, inputs)` pairs.
  pub fn new<I, N, S>(manifolds: I) -> Result<Self, GraphError>
  where
    I: IntoIterator<Item = (N, Vec<S>)>,
    N: Into<String>,
    S: Into<String>,
  {
    let mut inputs: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for (name, declared) in manifolds {
      let name = name.into();
      let mut seen = BTreeSet::new();
      let mut ordered = Vec::with_capacity(declared.len());
      for input in declared {
        let input = input.into();
        if !seen.insert(input.clone()) {
          return Err(GraphError::DuplicateInput { name, input });
        }
        ordered.push(input);
      }
      if inputs.contains_key(&name) {
        return Err(GraphError::DuplicateName(name));
      }
      inputs.insert(name, ordered);
    }

    // Every input must name an installed manifold
    for (name, declared) in &inputs {
      if let Some(unknown) = declared.iter().find(|input| !inputs.contains_key(*input)) {
        return Err(GraphError::UnknownInput {
          name: name.clone(),
          input: unknown.clone(),
        });
      }
    }

    detect_cycle(&inputs)?;

    let mut dependents: BTreeMap<String, Vec<String>> =
      inputs.keys().map(|name| (name.clone(), Vec::new())).collect();
    for (name, declared) in &inputs {
      for input in declared {
        dependents
          .entry(input.clone())
          .or_default()
          .push(name.clone());
      }
    }

    let start_order = topological_order(&inputs, &dependents);

    Ok(Self {
      inputs,
      dependents,
      start_order,
    })
  }

  /// Number of installed manifolds.
  pub fn len(&self) -> usize {
    self.inputs.len()
  }

  pub fn is_empty(&self) -> bool {
    self.inputs.is_empty()
  }

  /// Declared inputs of a manifold, in declaration order.
  pub fn inputs(&self, name: &str) -> &[String] {
    self.inputs.get(name).map(|v| v.as_slice()).unwrap_or(&[])
  }

  /// Direct dependents of a manifold.
  pub fn dependents(&self, name: &str) -> &[String] {
    self
      .dependents
      .get(name)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }

  /// A valid start order: every manifold appears after all of its inputs.
  pub fn start_order(&self) -> &[String] {
    &self.start_order
  }

  /// The reverse of [`Graph::start_order`]: dependents before their inputs.
  pub fn stop_order(&self) -> impl Iterator<Item = &str> {
    self.start_order.iter().rev().map(String::as_str)
  }
}

/// Depth-first search over inputs, reporting the first back-edge as a path.
fn detect_cycle(inputs: &BTreeMap<String, Vec<String>>) -> Result<(), GraphError> {
  let mut marks: HashMap<&str, Mark> = HashMap::new();
  let mut path: Vec<&str> = Vec::new();

  for root in inputs.keys() {
    if marks.contains_key(root.as_str()) {
      continue;
    }
    visit(root, inputs, &mut marks, &mut path)?;
  }
  Ok(())
}

fn visit<'a>(
  name: &'a str,
  inputs: &'a BTreeMap<String, Vec<String>>,
  marks: &mut HashMap<&'a str, Mark>,
  path: &mut Vec<&'a str>,
) -> Result<(), GraphError> {
  marks.insert(name, Mark::Visiting);
  path.push(name);

  for input in inputs.get(name).into_iter().flatten() {
    match marks.get(input.as_str()) {
      Some(Mark::Done) => {}
      Some(Mark::Visiting) => {
        let start = path.iter().position(|n| *n == input.as_str()).unwrap_or(0);
        let mut cycle: Vec<String> = path[start..].iter().map(|n| n.to_string()).collect();
        cycle.push(input.clone());
        return Err(GraphError::CycleDetected { path: cycle });
      }
      None => visit(input, inputs, marks, path)?,
    }
  }

  path.pop();
  marks.insert(name, Mark::Done);
  Ok(())
}

/// Kahn's algorithm; ties are broken by name.
fn topological_order(
  inputs: &BTreeMap<String, Vec<String>>,
  dependents: &BTreeMap<String, Vec<String>>,
) -> Vec<String> {
  let mut pending: BTreeMap<&str, usize> = inputs
    .iter()
    .map(|(name, declared)| (name.as_str(), declared.len()))
    .collect();
  let mut ready: BTreeSet<&str> = pending
    .iter()
    .filter(|(_, count)| **count == 0)
    .map(|(name, _)| *name)
    .collect();

  let mut order = Vec::with_capacity(inputs.len());
  while let Some(name) = ready.pop_first() {
    order.push(name.to_string());
    for dependent in dependents.get(name).into_iter().flatten() {
      if let Some(count) = pending.get_mut(dependent.as_str()) {
        *count = count.saturating_sub(1);
        if *count == 0 {
          ready.insert(dependent.as_str());
        }
      }
    }
  }
  order
}
