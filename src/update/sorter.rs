/*
 * Copyright 2025 Michael Krolikowski
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::container::Container;

/// Which containers a session touches and in which order.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Plan {
    /// Ids to act on, dependencies before dependents.
    pub order: Vec<String>,
    /// Fresh containers re-created because something they depend on is updated.
    pub restart: HashSet<String>,
    /// Dependency cycles touching the update, members in engine order.
    pub cycles: Vec<Vec<String>>,
    /// Direct dependents of each planned container within the plan.
    pub dependents: HashMap<String, Vec<String>>,
}

struct Graph {
    /// `depends_on[i]` holds the indices container `i` depends on.
    depends_on: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
}

impl Graph {
    fn new(containers: &[Container]) -> Graph {
        let index: HashMap<&str, usize> = containers
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.as_str(), i))
            .collect();
        let mut depends_on = vec![Vec::new(); containers.len()];
        let mut dependents = vec![Vec::new(); containers.len()];
        for (i, container) in containers.iter().enumerate() {
            for link in container.links() {
                if let Some(&j) = index.get(link.as_str())
                    && i != j
                {
                    depends_on[i].push(j);
                    dependents[j].push(i);
                }
            }
        }
        Graph {
            depends_on,
            dependents,
        }
    }

    /// Seeds plus everything transitively depending on them, never entering `blocked`.
    fn closure(&self, seeds: &[usize], blocked: &HashSet<usize>) -> HashSet<usize> {
        let mut reached: HashSet<usize> = seeds.iter().copied().collect();
        let mut queue: VecDeque<usize> = seeds.iter().copied().collect();
        while let Some(i) = queue.pop_front() {
            for &dependent in &self.dependents[i] {
                if !blocked.contains(&dependent) && reached.insert(dependent) {
                    queue.push_back(dependent);
                }
            }
        }
        reached
    }

    /// Kahn's algorithm over `nodes`; ties go to the lowest engine index.
    fn sort(&self, nodes: &HashSet<usize>) -> Vec<usize> {
        let mut pending: HashMap<usize, usize> = nodes
            .iter()
            .map(|&i| {
                let count = self.depends_on[i].iter().filter(|j| nodes.contains(*j)).count();
                (i, count)
            })
            .collect();
        let mut ready: BTreeSet<usize> = pending
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(&i, _)| i)
            .collect();
        let mut order = Vec::with_capacity(nodes.len());
        while let Some(i) = ready.pop_first() {
            order.push(i);
            for dependent in &self.dependents[i] {
                if let Some(count) = pending.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(*dependent);
                    }
                }
            }
        }
        order
    }

    fn components(&self) -> Vec<Vec<usize>> {
        let mut tarjan = Tarjan {
            graph: self,
            index: 0,
            indices: vec![None; self.depends_on.len()],
            lowlink: vec![0; self.depends_on.len()],
            stack: Vec::new(),
            on_stack: vec![false; self.depends_on.len()],
            components: Vec::new(),
        };
        for v in 0..self.depends_on.len() {
            if tarjan.indices[v].is_none() {
                tarjan.connect(v);
            }
        }
        tarjan.components
    }
}

struct Tarjan<'a> {
    graph: &'a Graph,
    index: usize,
    indices: Vec<Option<usize>>,
    lowlink: Vec<usize>,
    stack: Vec<usize>,
    on_stack: Vec<bool>,
    components: Vec<Vec<usize>>,
}

impl Tarjan<'_> {
    fn connect(&mut self, v: usize) {
        self.indices[v] = Some(self.index);
        self.lowlink[v] = self.index;
        self.index += 1;
        self.stack.push(v);
        self.on_stack[v] = true;

        let graph = self.graph;
        for &w in &graph.depends_on[v] {
            match self.indices[w] {
                None => {
                    self.connect(w);
                    self.lowlink[v] = self.lowlink[v].min(self.lowlink[w]);
                }
                Some(index) if self.on_stack[w] => {
                    self.lowlink[v] = self.lowlink[v].min(index);
                }
                Some(_) => {}
            }
        }

        if Some(self.lowlink[v]) == self.indices[v] {
            let mut component = Vec::new();
            while let Some(w) = self.stack.pop() {
                self.on_stack[w] = false;
                component.push(w);
                if w == v {
                    break;
                }
            }
            component.sort_unstable();
            self.components.push(component);
        }
    }
}

/// Orders the update of `stale` containers and the restart of their dependents.
///
/// `containers` is the frozen snapshot in engine order. Containers in `frozen`
/// are never acted on and do not pass restarts on to their own dependents.
pub fn plan(containers: &[Container], stale: &HashSet<String>, frozen: &HashSet<String>) -> Plan {
    let graph = Graph::new(containers);
    let ids: Vec<&str> = containers.iter().map(|c| c.id.as_str()).collect();
    let blocked: HashSet<usize> = (0..ids.len()).filter(|&i| frozen.contains(ids[i])).collect();
    let seeds: Vec<usize> = (0..ids.len())
        .filter(|&i| stale.contains(ids[i]) && !blocked.contains(&i))
        .collect();

    let reached = graph.closure(&seeds, &blocked);
    let cycles: Vec<Vec<usize>> = graph
        .components()
        .into_iter()
        .filter(|component| component.len() > 1 && component.iter().any(|i| reached.contains(i)))
        .collect();

    let mut excluded = blocked;
    excluded.extend(cycles.iter().flatten().copied());
    let seeds: Vec<usize> = seeds.into_iter().filter(|i| !excluded.contains(i)).collect();
    let planned = graph.closure(&seeds, &excluded);
    let order = graph.sort(&planned);

    let dependents: HashMap<String, Vec<String>> = order
        .iter()
        .map(|&i| {
            let direct: Vec<String> = graph.dependents[i]
                .iter()
                .filter(|j| planned.contains(*j))
                .map(|&j| ids[j].to_string())
                .collect();
            (ids[i].to_string(), direct)
        })
        .collect();

    Plan {
        order: order.iter().map(|&i| ids[i].to_string()).collect(),
        restart: planned
            .iter()
            .filter(|&&i| !stale.contains(ids[i]))
            .map(|&i| ids[i].to_string())
            .collect(),
        cycles: cycles
            .iter()
            .map(|c| c.iter().map(|&i| ids[i].to_string()).collect())
            .collect(),
        dependents,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::plan;
    use crate::container::{Container, tests::container};

    const DEPENDS_ON: &str = "com.centurylinklabs.watchtower.depends-on";

    fn id(name: &str) -> String {
        format!("{name}0000000000000000")
    }

    fn ids(names: &[&str]) -> HashSet<String> {
        names.iter().map(|n| id(n)).collect()
    }

    fn order(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| id(n)).collect()
    }

    fn app(name: &str, depends_on: Option<&str>) -> Container {
        let c = container(name, "app", "sha256:a");
        match depends_on {
            Some(deps) => c.with_label(DEPENDS_ON, deps),
            None => c,
        }
    }

    #[test]
    fn dependencies_first_then_engine_order() {
        let containers = vec![
            app("web", Some("db")),
            app("worker", None),
            app("db", None),
        ];
        let plan = plan(&containers, &ids(&["web", "worker", "db"]), &HashSet::new());
        assert_eq!(plan.order, order(&["worker", "db", "web"]));
        assert!(plan.restart.is_empty());
        assert_eq!(plan.dependents[&id("db")], order(&["web"]));
    }

    #[test]
    fn dependents_of_stale_are_restarted() {
        let containers = vec![
            app("proxy", Some("web")),
            app("web", Some("db")),
            app("db", None),
            app("other", None),
        ];
        let plan = plan(&containers, &ids(&["db"]), &HashSet::new());
        assert_eq!(plan.order, order(&["db", "web", "proxy"]));
        assert_eq!(plan.restart, ids(&["web", "proxy"]));
    }

    #[test]
    fn network_mode_counts_as_link() {
        let mut sidecar = app("sidecar", None);
        sidecar.host_config.network_mode = Some("container:vpn".to_string());
        let containers = vec![sidecar, app("vpn", None)];
        let plan = plan(&containers, &ids(&["vpn"]), &HashSet::new());
        assert_eq!(plan.order, order(&["vpn", "sidecar"]));
    }

    #[test]
    fn frozen_containers_are_left_alone() {
        let containers = vec![app("web", Some("db")), app("db", None)];
        let plan = plan(&containers, &ids(&["db"]), &ids(&["web"]));
        assert_eq!(plan.order, order(&["db"]));
        assert!(plan.restart.is_empty());
    }

    #[test]
    fn cycles_are_isolated() {
        let containers = vec![
            app("a", Some("b")),
            app("b", Some("a")),
            app("c", None),
            app("d", Some("a")),
        ];
        let plan = plan(&containers, &ids(&["a", "b", "c"]), &HashSet::new());
        assert_eq!(plan.cycles, vec![order(&["a", "b"])]);
        assert_eq!(plan.order, order(&["c"]));
        assert!(plan.restart.is_empty());
    }

    #[test]
    fn untouched_cycles_are_ignored() {
        let containers = vec![app("a", Some("b")), app("b", Some("a")), app("c", None)];
        let plan = plan(&containers, &ids(&["c"]), &HashSet::new());
        assert!(plan.cycles.is_empty());
        assert_eq!(plan.order, order(&["c"]));
    }

    #[test]
    fn unknown_links_are_ignored() {
        let containers = vec![app("web", Some("elsewhere,web"))];
        let plan = plan(&containers, &ids(&["web"]), &HashSet::new());
        assert_eq!(plan.order, order(&["web"]));
    }
}
