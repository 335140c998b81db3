//! `restricted(node, network) = nodeDefault XOR networkInversion`, tri-state
//! over `{false, true, unset}` on either input.

use crate::model::Restricted;

/// Compute the tri-state restriction verdict for one `(node, network)` pair.
/// "Unset" on either input means "restricted" is itself undefined.
pub fn resolve(node_default_policy: Option<bool>, network_inversion: Option<bool>) -> Restricted {
    match (node_default_policy, network_inversion) {
        (Some(default), Some(inversion)) => {
            if default ^ inversion {
                Restricted::Yes
            } else {
                Restricted::No
            }
        }
        _ => Restricted::Undefined,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truth_table_exhaustive() {
        // (default, inversion) -> expected
        let cases: [(Option<bool>, Option<bool>, Restricted); 9] = [
            (Some(false), Some(false), Restricted::No),
            (Some(false), Some(true), Restricted::Yes),
            (Some(true), Some(false), Restricted::Yes),
            (Some(true), Some(true), Restricted::No),
            (None, Some(false), Restricted::Undefined),
            (None, Some(true), Restricted::Undefined),
            (Some(false), None, Restricted::Undefined),
            (Some(true), None, Restricted::Undefined),
            (None, None, Restricted::Undefined),
        ];
        for (default, inversion, expected) in cases {
            assert_eq!(
                resolve(default, inversion),
                expected,
                "default={default:?} inversion={inversion:?}"
            );
        }
    }
}
