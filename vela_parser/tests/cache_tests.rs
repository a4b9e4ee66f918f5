//! Concurrency tests for the tree cache.
//!
//! The interleaving test pins down the blocking contract: a second worker
//! asking for a reserved key blocks until the first calls `done`, then
//! either takes over the reservation or observes the published tree.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use vela_core::Context;
use vela_parser::{Tree, TreeCache};

#[test]
fn test_deterministic_interleaving() {
    let path = "/index.html";
    let ctx = Context::Html;
    let tree = Arc::new(Tree::new(path, ctx));
    let cache = Arc::new(TreeCache::new());

    let expected = [
        "b: get...",
        "a: done...",
        "b: get ok",
        "a: done ok",
        "a: get...",
        "b: add...",
        "b: add ok",
        "a: get ok",
    ];

    let (steps, collected) = mpsc::channel::<&'static str>();

    let worker_a = {
        let cache = Arc::clone(&cache);
        let tree = Arc::clone(&tree);
        let steps_a = steps.clone();
        thread::spawn(move || {
            // a reserves the key.
            assert!(cache.get(path, ctx).is_none());

            let worker_b = {
                let cache = Arc::clone(&cache);
                let tree = Arc::clone(&tree);
                let steps_b = steps_a.clone();
                thread::spawn(move || {
                    steps_b.send("b: get...").unwrap();
                    // Blocks until a calls done, then takes over the
                    // reservation.
                    let got = cache.get(path, ctx);
                    assert!(got.is_none(), "b expected to take the reservation");
                    steps_b.send("b: get ok").unwrap();
                    thread::sleep(Duration::from_millis(100));
                    steps_b.send("b: add...").unwrap();
                    cache.add(path, ctx, tree);
                    steps_b.send("b: add ok").unwrap();
                    thread::sleep(Duration::from_millis(100));
                    cache.done(path, ctx);
                })
            };

            thread::sleep(Duration::from_millis(100));
            steps_a.send("a: done...").unwrap();
            cache.done(path, ctx);
            thread::sleep(Duration::from_millis(50));
            steps_a.send("a: done ok").unwrap();
            steps_a.send("a: get...").unwrap();
            // b still holds the reservation: blocks until b adds.
            let got = cache.get(path, ctx).expect("a expected b's tree");
            assert_eq!(got.path, path);
            steps_a.send("a: get ok").unwrap();

            worker_b.join().unwrap();
        })
    };
    drop(steps);

    let executed: Vec<&'static str> = collected.iter().collect();
    worker_a.join().unwrap();
    assert_eq!(executed, expected);
}

#[test]
fn test_waiter_sees_added_tree_without_done() {
    // A adds before done: a blocked B gets the tree as soon as add lands.
    let path = "/page.html";
    let ctx = Context::Html;
    let tree = Arc::new(Tree::new(path, ctx));
    let cache = Arc::new(TreeCache::new());

    assert!(cache.get(path, ctx).is_none());

    let waiter = {
        let cache = Arc::clone(&cache);
        thread::spawn(move || cache.get(path, ctx))
    };

    thread::sleep(Duration::from_millis(50));
    cache.add(path, ctx, Arc::clone(&tree));
    let got = waiter.join().unwrap().expect("waiter expected a tree");
    assert!(Arc::ptr_eq(&got, &tree));
    cache.done(path, ctx);
}

#[test]
fn test_failed_parse_releases_the_reservation() {
    // done without add clears the slot so another worker can retry.
    let path = "/broken.html";
    let ctx = Context::Text;
    let cache = Arc::new(TreeCache::new());

    assert!(cache.get(path, ctx).is_none());

    let retrier = {
        let cache = Arc::clone(&cache);
        thread::spawn(move || {
            let got = cache.get(path, ctx);
            // The first worker failed, so this worker holds the
            // reservation now.
            assert!(got.is_none());
            cache.done(path, ctx);
        })
    };

    thread::sleep(Duration::from_millis(50));
    cache.done(path, ctx);
    retrier.join().unwrap();
}

#[test]
fn test_many_waiters_one_add() {
    let path = "/shared.html";
    let ctx = Context::Html;
    let tree = Arc::new(Tree::new(path, ctx));
    let cache = Arc::new(TreeCache::new());

    assert!(cache.get(path, ctx).is_none());

    let waiters: Vec<_> = (0..6)
        .map(|_| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || cache.get(path, ctx))
        })
        .collect();

    thread::sleep(Duration::from_millis(50));
    cache.add(path, ctx, Arc::clone(&tree));
    cache.done(path, ctx);

    for waiter in waiters {
        let got = waiter.join().unwrap().expect("waiter expected a tree");
        assert!(Arc::ptr_eq(&got, &tree));
    }
}
