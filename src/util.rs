use std::time::Instant;

pub fn timed_scope<R, F: FnOnce() -> R>(label: &str, fun: F) -> R {
    let start = Instant::now();

    let res = fun();

    let time = Instant::now().duration_since(start);
    println!("{label} took: {time:?}");

    res
}

/// Reorders `data` so that `data[i]` ends up holding the old `data[perm[i]]`.
/// `perm` must be a permutation of `0..data.len()`; it is consumed as
/// cycle-walk scratch.
pub fn apply_permutation<T>(data: &mut [T], mut perm: Vec<u32>) {
    debug_assert_eq!(data.len(), perm.len());

    for idx in 0..data.len() {
        if perm[idx] as usize != idx {
            let mut current_idx = idx;
            loop {
                let target_idx = perm[current_idx] as usize;
                perm[current_idx] = current_idx as u32;
                if perm[target_idx] as usize == target_idx {
                    break;
                }
                data.swap(current_idx, target_idx);
                current_idx = target_idx;
            }
        }
    }
}
