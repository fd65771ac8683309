//! Tuple construction
//!
//! Tuples are enumerated in mixed-radix order over the endpoint list: the
//! first position varies fastest, position `i` changes every `len^i` tuples.
//! With two endpoints `[A, B]` and a tuple size of two the order is
//! `(A,A) (B,A) (A,B) (B,B)`.

use kite_common::{EndpointSpec, KiteConfig, TestConfig, Tuple, MAX_TUPLE_SIZE};
use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};

/// Upper bound on the number of tuples a single test may enumerate
pub const MAX_TUPLES: usize = 1_000_000;

/// Build every tuple of `tuple_size` endpoints.
///
/// With `permute` set, tuples holding the same endpoint (by equality) more
/// than once are left out, keeping the relative order of the rest. Each tuple
/// owns its own copy of the endpoints.
pub fn build_tuples(
    endpoints: &[EndpointSpec],
    tuple_size: usize,
    permute: bool,
) -> EngineResult<Vec<Tuple>> {
    let radix = endpoints.len();
    if radix == 0 || tuple_size == 0 {
        return Ok(Vec::new());
    }

    let too_large = || EngineError::MatrixTooLarge {
        endpoints: radix,
        tuple_size,
        limit: MAX_TUPLES,
    };
    if tuple_size > MAX_TUPLE_SIZE {
        return Err(too_large());
    }

    let tuples = if permute {
        if tuple_size > radix {
            return Ok(Vec::new());
        }
        let count = falling_factorial(radix, tuple_size)
            .filter(|&count| count <= MAX_TUPLES)
            .ok_or_else(too_large)?;
        permutations(endpoints, tuple_size, count)
    } else {
        let total = u32::try_from(tuple_size)
            .ok()
            .and_then(|exponent| radix.checked_pow(exponent))
            .filter(|&total| total <= MAX_TUPLES)
            .ok_or_else(too_large)?;
        product(endpoints, tuple_size, total)
    };

    debug!(
        "Built {} tuple(s) from {} endpoint(s), size {}, permute {}",
        tuples.len(),
        radix,
        tuple_size,
        permute
    );
    Ok(tuples)
}

/// `n * (n - 1) * .. * (n - k + 1)`, or `None` on overflow
fn falling_factorial(n: usize, k: usize) -> Option<usize> {
    (0..k).try_fold(1usize, |acc, i| acc.checked_mul(n - i))
}

fn product(endpoints: &[EndpointSpec], tuple_size: usize, total: usize) -> Vec<Tuple> {
    let radix = endpoints.len();
    let mut tuples = Vec::with_capacity(total);
    let mut digits = vec![0usize; tuple_size];

    for id in 0..total {
        let picked = digits.iter().map(|&d| endpoints[d].clone()).collect();
        tuples.push(Tuple::new(id, picked));

        // Increment with carry, least significant position first
        for digit in digits.iter_mut() {
            *digit += 1;
            if *digit < radix {
                break;
            }
            *digit = 0;
        }
    }
    tuples
}

/// Permutations without repetition in mixed-radix order.
///
/// Positions are filled from the last (slowest) to the first (fastest), so a
/// depth-first walk visits tuples in the same order as the full product and
/// never enters a branch that already repeats an endpoint.
fn permutations(endpoints: &[EndpointSpec], tuple_size: usize, capacity: usize) -> Vec<Tuple> {
    let mut tuples = Vec::with_capacity(capacity);
    let mut digits = vec![0usize; tuple_size];
    fill_position(endpoints, &mut digits, tuple_size, &mut tuples);
    tuples
}

fn fill_position(
    endpoints: &[EndpointSpec],
    digits: &mut [usize],
    unfilled: usize,
    tuples: &mut Vec<Tuple>,
) {
    let Some(slot) = unfilled.checked_sub(1) else {
        let id = tuples.len();
        let picked = digits.iter().map(|&d| endpoints[d].clone()).collect();
        tuples.push(Tuple::new(id, picked));
        return;
    };

    for (index, candidate) in endpoints.iter().enumerate() {
        if digits[slot + 1..].iter().any(|&d| endpoints[d] == *candidate) {
            continue;
        }
        digits[slot] = index;
        fill_position(endpoints, digits, slot, tuples);
    }
}

/// Build tuples from explicit rows of endpoint indices
pub fn tuples_from_matrix(
    endpoints: &[EndpointSpec],
    matrix: &[Vec<usize>],
) -> EngineResult<Vec<Tuple>> {
    matrix
        .iter()
        .enumerate()
        .map(|(id, row)| {
            let picked = row
                .iter()
                .map(|&index| {
                    endpoints.get(index).cloned().ok_or_else(|| {
                        EngineError::InvalidSchedule(format!(
                            "matrix row {} references endpoint {} of {}",
                            id,
                            index,
                            endpoints.len()
                        ))
                    })
                })
                .collect::<EngineResult<Vec<_>>>()?;
            Ok(Tuple::new(id, picked))
        })
        .collect()
}

/// Tuples for one test of a config: the explicit matrix when present,
/// otherwise the generated product.
pub fn tuples_for(config: &KiteConfig, test: &TestConfig) -> EngineResult<Vec<Tuple>> {
    let tuples = match &config.matrix {
        Some(matrix) => tuples_from_matrix(&config.endpoints, matrix)?,
        None => build_tuples(&config.endpoints, test.tuple_size, test.permute)?,
    };
    info!("{}: {} test case(s)", test.name, tuples.len());
    Ok(tuples)
}
