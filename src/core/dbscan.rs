use crate::core::similarity::unit_cosine;
use rayon::prelude::*;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Label {
    Undefined,
    Noise,
    Cluster(usize),
}

/// DBSCAN over cosine distance (`1 - cosine_similarity`).
///
/// `vectors` must already be L2-normalised. A point counts itself towards `min_pts`.
/// Returns one label per input: `Some(cluster_index)` (0-based, in discovery order) or
/// `None` for noise.
pub fn dbscan(vectors: &[Vec<f32>], eps: f32, min_pts: usize) -> Vec<Option<usize>> {
    let n = vectors.len();
    if n == 0 {
        return Vec::new();
    }

    let neighbors: Vec<Vec<usize>> = (0..n)
        .into_par_iter()
        .map(|i| range_query(vectors, i, eps))
        .collect();

    let mut labels = vec![Label::Undefined; n];
    let mut cluster_count = 0;

    for i in 0..n {
        if labels[i] != Label::Undefined {
            continue;
        }

        if neighbors[i].len() < min_pts {
            labels[i] = Label::Noise;
            continue;
        }

        let cluster = cluster_count;
        cluster_count += 1;
        labels[i] = Label::Cluster(cluster);

        let mut queue: VecDeque<usize> = neighbors[i].iter().copied().filter(|&j| j != i).collect();

        while let Some(q) = queue.pop_front() {
            match labels[q] {
                // Border point previously marked noise
                Label::Noise => {
                    labels[q] = Label::Cluster(cluster);
                    continue;
                }
                Label::Cluster(_) => continue,
                Label::Undefined => {}
            }

            labels[q] = Label::Cluster(cluster);
            if neighbors[q].len() >= min_pts {
                queue.extend(neighbors[q].iter().copied());
            }
        }
    }

    labels
        .into_iter()
        .map(|label| match label {
            Label::Cluster(c) => Some(c),
            _ => None,
        })
        .collect()
}

/// Group point indices by cluster label, each group in ascending index order.
pub fn group_labels(labels: &[Option<usize>]) -> Vec<Vec<usize>> {
    let cluster_count = labels.iter().flatten().map(|&c| c + 1).max().unwrap_or(0);
    let mut groups = vec![Vec::new(); cluster_count];

    for (index, label) in labels.iter().enumerate() {
        if let Some(cluster) = label {
            groups[*cluster].push(index);
        }
    }

    groups
}

fn range_query(vectors: &[Vec<f32>], idx: usize, eps: f32) -> Vec<usize> {
    let q = &vectors[idx];
    vectors
        .iter()
        .enumerate()
        .filter(|(_, v)| 1.0 - unit_cosine(q, v) <= eps)
        .map(|(i, _)| i)
        .collect()
}
