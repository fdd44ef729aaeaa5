// SPDX-FileCopyrightText: Copyright © 2020-2026 the project authors
//
// SPDX-License-Identifier: MPL-2.0

use petgraph::{prelude::Graph, stable_graph::IndexType, visit::Dfs, EdgeType};

/// Given an input [`Graph`] and the start nodes, construct a subgraph reachable from them.
pub fn subgraph<N, E, Ty, Ix>(graph: &Graph<N, E, Ty, Ix>, starting_nodes: &[N]) -> Graph<N, E, Ty, Ix>
where
    N: PartialEq + Clone,
    E: Clone,
    Ix: IndexType,
    Ty: EdgeType,
{
    let add_node = |graph: &mut Graph<N, E, Ty, Ix>, node| {
        if let Some(index) = graph.node_indices().find(|i| graph[*i] == node) {
            index
        } else {
            graph.add_node(node)
        }
    };

    let mut res = Graph::default();
    let mut dfs = Dfs::empty(&graph);

    for starting_node in starting_nodes {
        let Some(starting_node_index) = graph.node_indices().find(|n| graph[*n] == *starting_node) else {
            continue;
        };

        dfs.move_to(starting_node_index);

        while let Some(node) = dfs.next(&graph) {
            let node_index = add_node(&mut res, graph[node].clone());
            for neighbor in graph.neighbors_directed(node, petgraph::Direction::Outgoing) {
                if let Some(edge) = graph.find_edge(node, neighbor) {
                    let neighbor_index = add_node(&mut res, graph[neighbor].clone());
                    res.add_edge(node_index, neighbor_index, graph[edge].clone());
                }
            }
        }
    }

    res
}
