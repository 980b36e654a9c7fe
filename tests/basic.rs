use lazy_rx::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use test_log::test;

/// Observer that appends every published value to a shared log.
#[derive(Default)]
struct ValueLog(Mutex<Vec<i32>>);

impl ValueLog {
    fn values(&self) -> Vec<i32> {
        self.0.lock().unwrap().clone()
    }
}

impl Observer<i32> for ValueLog {
    fn on_next(&self, message: &i32) {
        self.0.lock().unwrap().push(*message);
    }
}

fn counted_double(input: &Expression<i32>, counter: &Arc<AtomicUsize>) -> Expression<i32> {
    let counter = Arc::clone(counter);
    Expression::derived(input, move |v| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(v * 2)
    })
}

#[test]
fn test_source_set_update() {
    let a = Expression::source(1);
    assert_eq!(a.get().unwrap(), 1);
    a.set(2);
    assert_eq!(a.get().unwrap(), 2);
    a.update(|v| v + 3);
    assert_eq!(a.get().unwrap(), 5);
}

#[test]
fn test_derived_is_lazy() {
    let a = Expression::source(1);
    let evals = Arc::new(AtomicUsize::new(0));
    let d = counted_double(&a, &evals);

    // Nothing evaluates until the first read.
    assert_eq!(evals.load(Ordering::SeqCst), 0);
    assert_eq!(d.get().unwrap(), 2);
    assert_eq!(d.get().unwrap(), 2);
    assert_eq!(evals.load(Ordering::SeqCst), 1);

    // Setting the leaf dirties the dependent but still computes nothing.
    a.set(3);
    assert_eq!(evals.load(Ordering::SeqCst), 1);
    assert_eq!(d.get().unwrap(), 6);
    assert_eq!(evals.load(Ordering::SeqCst), 2);
}

#[test]
fn test_combined_two_types() {
    let count = Expression::source(2);
    let word = Expression::source("apple".to_string());
    let label = Expression::combined(&count, &word, |n, w| Ok(format!("{n} x {w}")));
    assert_eq!(label.get().unwrap(), "2 x apple");

    word.set("pear".to_string());
    assert_eq!(label.get().unwrap(), "2 x pear");
    count.set(7);
    assert_eq!(label.get().unwrap(), "7 x pear");
}

#[test]
fn test_invalidate_is_idempotent() {
    let a = Expression::source(4);
    let evals = Arc::new(AtomicUsize::new(0));
    let d = counted_double(&a, &evals);
    assert_eq!(d.get().unwrap(), 8);

    a.invalidate();
    a.invalidate();
    assert_eq!(d.get().unwrap(), 8);
    // Two invalidations without an intervening read cost one recomputation.
    assert_eq!(evals.load(Ordering::SeqCst), 2);
    assert_eq!(d.get().unwrap(), 8);
    assert_eq!(evals.load(Ordering::SeqCst), 2);
}

#[test]
fn test_compound_sum_propagation() {
    let a = Expression::source(2);
    let b = Expression::source(3);
    let evals = Arc::new(AtomicUsize::new(0));
    let c = {
        let evals = Arc::clone(&evals);
        CompoundExpression::new(&[a.clone(), b.clone()], move |values: &[i32]| {
            evals.fetch_add(1, Ordering::SeqCst);
            Ok(values.iter().sum::<i32>())
        })
    };

    assert_eq!(c.get().unwrap(), 5);
    assert_eq!(c.get().unwrap(), 5);
    assert_eq!(evals.load(Ordering::SeqCst), 1);

    a.invalidate();
    a.set(10);
    assert_eq!(c.get().unwrap(), 13);
    assert_eq!(c.get().unwrap(), 13);
    assert_eq!(c.get().unwrap(), 13);
    // Recomputed exactly once despite repeated reads.
    assert_eq!(evals.load(Ordering::SeqCst), 2);
}

#[test]
fn test_compound_set_dependencies() {
    let a = Expression::source(2);
    let b = Expression::source(3);
    let c = Expression::source(7);
    let sum = CompoundExpression::new(&[a.clone(), b.clone()], |values: &[i32]| {
        Ok(values.iter().sum::<i32>())
    });
    assert_eq!(sum.get().unwrap(), 5);

    sum.set_dependencies(&[b.clone(), c.clone()]);
    assert_eq!(sum.get().unwrap(), 10);

    // The old member no longer reaches this node.
    a.set(100);
    assert_eq!(sum.get().unwrap(), 10);

    // The new members still do.
    c.set(17);
    assert_eq!(sum.get().unwrap(), 20);
}

#[test]
fn test_copy_decouples_source() {
    let a = Expression::source(1);
    let b = a.copy();
    a.set(9);
    assert_eq!(a.get().unwrap(), 9);
    assert_eq!(b.get().unwrap(), 1);
    b.set(4);
    assert_eq!(a.get().unwrap(), 9);
    assert_eq!(b.get().unwrap(), 4);
}

#[test]
fn test_copy_derived_tracks_same_upstreams() {
    let a = Expression::source(1);
    let d = Expression::derived(&a, |v| Ok(v * 2));
    assert_eq!(d.get().unwrap(), 2);

    let e = d.copy();
    assert_eq!(e.get().unwrap(), 2);

    // Invalidation of the shared upstream reaches both nodes.
    a.set(5);
    assert_eq!(d.get().unwrap(), 10);
    assert_eq!(e.get().unwrap(), 10);

    // Observer lists stay independent.
    let log = Arc::new(ValueLog::default());
    d.add_observer(log.clone());
    a.set(6);
    assert_eq!(e.get().unwrap(), 12);
    assert_eq!(log.values(), Vec::<i32>::new());
    assert_eq!(d.get().unwrap(), 12);
    assert_eq!(log.values(), vec![12]);
}

#[test]
fn test_compound_copy_freezes_dependencies() {
    let a = Expression::source(2);
    let b = Expression::source(3);
    let c = Expression::source(7);
    let sum = CompoundExpression::new(&[a.clone(), b.clone()], |values: &[i32]| {
        Ok(values.iter().sum::<i32>())
    });
    let frozen = sum.copy();
    assert_eq!(frozen.get().unwrap(), 5);

    sum.set_dependencies(&[c.clone()]);
    assert_eq!(sum.get().unwrap(), 7);
    // The copy keeps the dependency snapshot taken at copy time.
    assert_eq!(frozen.get().unwrap(), 5);
    a.set(10);
    assert_eq!(frozen.get().unwrap(), 13);
    assert_eq!(sum.get().unwrap(), 7);
}

#[test]
fn test_eval_failure_keeps_node_dirty() {
    let a = Expression::source(1);
    let evals = Arc::new(AtomicUsize::new(0));
    let d = {
        let evals = Arc::clone(&evals);
        Expression::derived(&a, move |v| {
            evals.fetch_add(1, Ordering::SeqCst);
            if *v < 0 {
                Err(EvalError::message("negative input"))
            } else {
                Ok(v * 2)
            }
        })
    };
    let log = Arc::new(ValueLog::default());
    d.add_observer(log.clone());

    a.set(-1);
    assert!(matches!(d.get(), Err(EvalError::Failed(_))));
    // Still dirty: every read retries the failing evaluation.
    assert!(d.get().is_err());
    assert_eq!(evals.load(Ordering::SeqCst), 2);
    // No value-changed notification fired for the failed attempts.
    assert_eq!(log.values(), Vec::<i32>::new());

    a.set(2);
    assert_eq!(d.get().unwrap(), 4);
    assert_eq!(log.values(), vec![4]);
}

#[test]
fn test_cycle_fails_fast() {
    let seed = Expression::source(1);
    let cyclic = CompoundExpression::new(&[seed.clone()], |values: &[i32]| {
        Ok(values.iter().sum::<i32>())
    });
    // Point the node at itself; evaluation must fail, not recurse.
    cyclic.set_dependencies(&[cyclic.expression().clone()]);
    assert!(matches!(cyclic.get(), Err(EvalError::Cycle)));
    // The node stays dirty and keeps reporting the cycle.
    assert!(matches!(cyclic.get(), Err(EvalError::Cycle)));
}

#[test]
fn test_dropped_dependency() {
    let a = Expression::source(3);
    let d = Expression::derived(&a, |v| Ok(v * 2));
    assert_eq!(d.get().unwrap(), 6);

    // Dependency edges are non-owning: dropping the leaf leaves the
    // dependent readable until it next needs to re-derive.
    drop(a);
    assert_eq!(d.get().unwrap(), 6);
    d.invalidate();
    assert!(matches!(d.get(), Err(EvalError::DroppedDependency)));
}

#[test]
fn test_function_buffer_fold() {
    let buffer = FunctionBuffer::fold(0, 3, |prev: &i32, back: &i32| Ok(prev + back));
    assert_eq!(buffer.front().unwrap(), 3);
    assert_eq!(buffer.set_back(4), 3);
    assert_eq!(buffer.front().unwrap(), 7);
    assert_eq!(buffer.front().unwrap(), 7);
}

#[test]
fn test_function_buffer_map() {
    let evals = Arc::new(AtomicUsize::new(0));
    let buffer = {
        let evals = Arc::clone(&evals);
        FunctionBuffer::map(3, move |back: &i32| {
            evals.fetch_add(1, Ordering::SeqCst);
            Ok(back * 10)
        })
    };
    assert_eq!(buffer.front().unwrap(), 30);
    assert_eq!(buffer.front().unwrap(), 30);
    assert_eq!(evals.load(Ordering::SeqCst), 1);

    assert_eq!(buffer.set_back(5), 3);
    assert_eq!(buffer.front().unwrap(), 50);
    assert_eq!(evals.load(Ordering::SeqCst), 2);
}

#[test]
fn test_function_buffer_failure_stays_dirty() {
    let buffer = FunctionBuffer::map(-1, |back: &i32| {
        if *back < 0 {
            Err(EvalError::message("negative back"))
        } else {
            Ok(back * 10)
        }
    });
    assert!(buffer.front().is_err());
    assert!(buffer.front().is_err());
    buffer.set_back(2);
    assert_eq!(buffer.front().unwrap(), 20);
}

#[test]
fn test_expression_buffer_tracks_back() {
    let back = Expression::source(3);
    let buffer = ExpressionBuffer::fold(0, back.clone(), |prev: &i32, b: &i32| Ok(prev + b));
    assert_eq!(buffer.front().unwrap(), 3);

    // Invalidation of the back dirties the front.
    back.set(4);
    assert_eq!(buffer.front().unwrap(), 7);
    assert_eq!(buffer.front().unwrap(), 7);
}

#[test]
fn test_expression_buffer_set_back() {
    let first = Expression::source(3);
    let buffer = ExpressionBuffer::fold(0, first.clone(), |prev: &i32, b: &i32| Ok(prev + b));
    assert_eq!(buffer.front().unwrap(), 3);

    let second = Expression::source(10);
    let previous = buffer.set_back(second.clone());
    assert_eq!(previous.get().unwrap(), 3);
    assert_eq!(buffer.front().unwrap(), 13);

    // The old back no longer dirties the front.
    previous.set(100);
    assert_eq!(buffer.front().unwrap(), 13);
    // The new one does.
    second.set(20);
    assert_eq!(buffer.front().unwrap(), 33);
}

#[test]
fn test_expression_observers() {
    let a = Expression::source(1);
    let d = Expression::derived(&a, |v| Ok(v * 2));
    let log = Arc::new(ValueLog::default());
    let observation = d.add_observer(log.clone());

    assert_eq!(d.get().unwrap(), 2);
    assert_eq!(log.values(), vec![2]);

    // Nothing fires before the lazy read, and clean reads fire nothing.
    a.set(5);
    assert_eq!(log.values(), vec![2]);
    assert_eq!(d.get().unwrap(), 10);
    assert_eq!(d.get().unwrap(), 10);
    assert_eq!(log.values(), vec![2, 10]);

    observation.cancel();
    a.set(6);
    assert_eq!(d.get().unwrap(), 12);
    assert_eq!(log.values(), vec![2, 10]);
}

#[test]
fn test_remove_observer() {
    let a = Expression::source(1);
    let d = Expression::derived(&a, |v| Ok(v + 1));
    let log = Arc::new(ValueLog::default());
    let observer: Arc<dyn Observer<i32>> = log.clone();
    d.add_observer(observer.clone());

    assert_eq!(d.get().unwrap(), 2);
    assert_eq!(log.values(), vec![2]);

    d.remove_observer(&observer);
    a.set(8);
    assert_eq!(d.get().unwrap(), 9);
    assert_eq!(log.values(), vec![2]);
}
