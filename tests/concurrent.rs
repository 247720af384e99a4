//! Isolation behavior across concurrent transactions of one keyspace:
//! uncommitted staging is invisible to other transactions, committed data
//! becomes visible to already-open transactions on their next read
//! (read-committed), and reads are therefore not repeatable.

use std::sync::mpsc;
use std::thread;

use cairn::{Config, Server, Value};
use rand::Rng;

const NUM_THREADS: usize = 4;
const OPERATIONS_PER_THREAD: usize = 25;

fn server() -> Server {
    Server::new(Config::default())
}

#[test]
fn concurrent_commits_from_many_sessions_all_land() {
    let server = server();
    {
        let session = server.session("stress").expect("session");
        let tx = session.transaction().write().expect("tx");
        tx.execute("define score sub attribute, datatype long; person sub entity, has score;")
            .expect("define");
        tx.commit().expect("commit schema");
    }

    thread::scope(|scope| {
        for _ in 0..NUM_THREADS {
            scope.spawn(|| {
                let session = server.session("stress").expect("session");
                let mut rng = rand::thread_rng();
                for _ in 0..OPERATIONS_PER_THREAD {
                    let tx = session.transaction().write().expect("tx");
                    let score: i64 = rng.gen_range(0..1_000_000);
                    tx.execute(&format!("insert $x isa person, has score {score};"))
                        .expect("insert");
                    tx.commit().expect("commit");
                }
                session.close();
            });
        }
    });

    let session = server.session("stress").expect("session");
    let tx = session.transaction().read().expect("read tx");
    let count = tx
        .execute("match $x isa person; get; count;")
        .expect("count")
        .count();
    assert_eq!((NUM_THREADS * OPERATIONS_PER_THREAD) as u64, count);
    tx.close();
}

#[test]
fn uncommitted_inserts_are_invisible_to_other_transactions() {
    let server = server();
    let session = server.session("read-uncommitted").expect("session");
    {
        let tx = session.transaction().write().expect("tx");
        tx.execute("define person sub entity;").expect("define");
        tx.commit().expect("commit schema");
    }

    let (staged_tx, staged_rx) = mpsc::channel::<()>();
    let (counted_tx, counted_rx) = mpsc::channel::<()>();

    thread::scope(|scope| {
        let session = &session;
        scope.spawn(move || {
            let tx1 = session.transaction().write().expect("tx1");
            tx1.execute("insert $x isa person;").expect("insert");
            staged_tx.send(()).expect("signal staged");
            counted_rx.recv().expect("await count");
            tx1.close();
        });
        scope.spawn(move || {
            let tx2 = session.transaction().write().expect("tx2");
            staged_rx.recv().expect("await stage");
            let count = tx2
                .execute("match $x isa person; get; count;")
                .expect("count")
                .count();
            assert_eq!(0, count);
            tx2.close();
            counted_tx.send(()).expect("signal counted");
        });
    });
}

#[test]
fn committed_inserts_become_visible_to_open_transactions() {
    let server = server();
    let session = server.session("read-committed").expect("session");
    {
        let tx = session.transaction().write().expect("tx");
        tx.execute("define person sub entity;").expect("define");
        tx.commit().expect("commit schema");
    }

    let (opened_tx, opened_rx) = mpsc::channel::<()>();
    let (committed_tx, committed_rx) = mpsc::channel::<()>();

    thread::scope(|scope| {
        let session = &session;
        scope.spawn(move || {
            let tx1 = session.transaction().write().expect("tx1");
            tx1.execute("insert $x isa person;").expect("insert");
            opened_rx.recv().expect("await tx2 open");
            tx1.commit().expect("commit");
            committed_tx.send(()).expect("signal commit");
        });
        scope.spawn(move || {
            let tx2 = session.transaction().write().expect("tx2");
            opened_tx.send(()).expect("signal open");
            committed_rx.recv().expect("await commit");
            let count = tx2
                .execute("match $x isa person; get; count;")
                .expect("count")
                .count();
            assert_eq!(1, count);
            tx2.close();
        });
    });
}

#[test]
fn reads_are_not_repeatable_at_read_committed() {
    let server = server();
    let session = server.session("non-repeatable").expect("session");
    {
        let tx = session.transaction().write().expect("tx");
        tx.execute(
            "define name sub attribute, datatype string; person sub entity, has name;",
        )
        .expect("define");
        tx.commit().expect("commit schema");
    }

    let (first_read_tx, first_read_rx) = mpsc::channel::<()>();
    let (committed_tx, committed_rx) = mpsc::channel::<()>();

    thread::scope(|scope| {
        let session = &session;
        scope.spawn(move || {
            let tx1 = session.transaction().write().expect("tx1");
            tx1.execute("insert $x isa person, has name 'Aretha';")
                .expect("insert");
            first_read_rx.recv().expect("await first read");
            tx1.commit().expect("commit");
            committed_tx.send(()).expect("signal commit");
        });
        scope.spawn(move || {
            let tx2 = session.transaction().write().expect("tx2");
            let value = Value::String("Aretha".into());
            let before = tx2.get_attributes_by_value(&value).expect("first read");
            assert!(before.is_empty());
            first_read_tx.send(()).expect("signal first read");
            committed_rx.recv().expect("await commit");
            let after = tx2.get_attributes_by_value(&value).expect("second read");
            assert_eq!(1, after.len());
            tx2.close();
        });
    });
}

#[test]
fn later_conflicting_commit_fails_validation_instead_of_merging() {
    let server = server();
    let session = server.session("conflict").expect("session");
    {
        let tx = session.transaction().write().expect("tx");
        tx.execute("define badge sub attribute, datatype long; person sub entity, key badge;")
            .expect("define");
        tx.commit().expect("commit schema");
    }

    let (first_done_tx, first_done_rx) = mpsc::channel::<()>();

    // Two transactions claim the same key value; the first commit wins, the
    // second fails key-uniqueness validation rather than merging silently.
    thread::scope(|scope| {
        let session = &session;
        scope.spawn(move || {
            let tx1 = session.transaction().write().expect("tx1");
            tx1.execute("insert $x isa person, has badge 7;").expect("insert");
            tx1.commit().expect("first commit wins");
            first_done_tx.send(()).expect("signal");
        });
        scope.spawn(move || {
            let tx2 = session.transaction().write().expect("tx2");
            tx2.execute("insert $y isa person, has badge 7;").expect("insert");
            first_done_rx.recv().expect("await first commit");
            match tx2.commit() {
                Err(cairn::CairnError::ValidationFailed(errors)) => {
                    assert!(errors.iter().any(|e| e.contains("key")));
                }
                other => panic!("expected validation failure, got {other:?}"),
            }
        });
    });
}
