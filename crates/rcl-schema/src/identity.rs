use crate::digest::Digest;

/// Compute the chain ID for an ordered list of layer digests.
///
/// Follows the OCI image identity rule:
/// - the empty chain has no identity (`None`, meaning the empty root),
/// - a single layer's chain ID is its own digest,
/// - `chain_id([d0..dn]) = sha256(chain_id([d0..dn-1]) + " " + dn)`.
///
/// The result depends only on the ordered digests, so equal sequences always
/// map to the same snapshot.
pub fn chain_id(diffs: &[Digest]) -> Option<Digest> {
    let (first, rest) = diffs.split_first()?;
    let mut current = first.clone();
    for diff in rest {
        current = fold(&current, diff);
    }
    Some(current)
}

/// Chain IDs of every non-empty prefix, root first.
pub fn chain_ids(diffs: &[Digest]) -> Vec<Digest> {
    let mut out: Vec<Digest> = Vec::with_capacity(diffs.len());
    for diff in diffs {
        let next = match out.last() {
            Some(parent) => fold(parent, diff),
            None => diff.clone(),
        };
        out.push(next);
    }
    out
}

fn fold(parent: &Digest, diff: &Digest) -> Digest {
    Digest::sha256(format!("{parent} {diff}").as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Digest {
        Digest::sha256(s.as_bytes())
    }

    #[test]
    fn empty_chain_has_no_id() {
        assert!(chain_id(&[]).is_none());
        assert!(chain_ids(&[]).is_empty());
    }

    #[test]
    fn single_layer_chain_is_its_digest() {
        assert_eq!(chain_id(&[d("a")]), Some(d("a")));
    }

    #[test]
    fn two_layers_fold_with_space_separator() {
        let l0 = Digest::parse(
            "sha256:a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4",
        )
        .unwrap();
        let l1 = Digest::parse(
            "sha256:f7a7e7b8d4e3e3b4c1a1b2c3d4e5f60718293a4b5c6d7e8f9a0b1c2d3e4f5a6b",
        )
        .unwrap();
        let expected = Digest::sha256(format!("{l0} {l1}").as_bytes());
        assert_eq!(chain_id(&[l0, l1]), Some(expected));
    }

    #[test]
    fn chain_id_is_deterministic() {
        let layers = [d("a"), d("b"), d("c")];
        assert_eq!(chain_id(&layers), chain_id(&layers));
    }

    #[test]
    fn permuting_layers_changes_id() {
        let abc = chain_id(&[d("a"), d("b"), d("c")]);
        let acb = chain_id(&[d("a"), d("c"), d("b")]);
        let bac = chain_id(&[d("b"), d("a"), d("c")]);
        assert_ne!(abc, acb);
        assert_ne!(abc, bac);
    }

    #[test]
    fn prefix_ids_match_individual_computation() {
        let layers = [d("a"), d("b"), d("c")];
        let prefixes = chain_ids(&layers);
        assert_eq!(prefixes.len(), 3);
        for (i, id) in prefixes.iter().enumerate() {
            assert_eq!(Some(id.clone()), chain_id(&layers[..=i]));
        }
    }
}
