//! Commit-time schema and instance validation, exercised end to end: each
//! test stages an invalid graph and asserts on the aggregated diagnostics.

use cairn::{CairnError, Config, DataType, Server, Value};

fn server() -> Server {
    Server::new(Config::default())
}

fn expect_validation_errors(result: cairn::Result<()>) -> Vec<String> {
    match result {
        Err(CairnError::ValidationFailed(errors)) => errors,
        other => panic!("expected validation failure, got {other:?}"),
    }
}

#[test]
fn role_without_a_relation_type_is_rejected() {
    let server = server();
    let session = server.session("orphan-role").expect("session");
    let tx = session.transaction().write().expect("tx");
    let person = tx.put_entity_type("person").expect("person");
    let orphan = tx.put_role("orphan").expect("role");
    tx.plays(person, orphan, false).expect("plays");
    let errors = expect_validation_errors(tx.commit());
    assert!(errors
        .iter()
        .any(|e| e.contains("'orphan'") && e.contains("not related")));
}

#[test]
fn relation_type_without_roles_is_rejected() {
    let server = server();
    let session = server.session("empty-relation-type").expect("session");
    let tx = session.transaction().write().expect("tx");
    tx.put_relation_type("loose-end").expect("relation type");
    let errors = expect_validation_errors(tx.commit());
    assert!(errors
        .iter()
        .any(|e| e.contains("'loose-end'") && e.contains("does not relate any role")));
}

#[test]
fn abstract_relation_type_may_have_no_roles() {
    let server = server();
    let session = server.session("abstract-relation").expect("session");
    let tx = session.transaction().write().expect("tx");
    let loose = tx.put_relation_type("abstract-base").expect("relation type");
    tx.set_abstract(loose, true).expect("abstract");
    tx.commit().expect("abstract relation type needs no roles");
}

#[test]
fn relation_type_hierarchy_must_cover_roles_both_ways() {
    let server = server();
    let session = server.session("hierarchy").expect("session");
    let tx = session.transaction().write().expect("tx");

    let spouse = tx.put_role("spouse").expect("spouse");
    let partner = tx.put_role("partner").expect("partner");
    let marriage = tx.put_relation_type("marriage").expect("marriage");
    tx.relates(marriage, spouse).expect("relates spouse");
    let civil = tx.put_relation_type("civil-union").expect("civil");
    tx.sup(civil, marriage).expect("sub marriage");
    tx.relates(civil, partner).expect("relates partner");

    let errors = expect_validation_errors(tx.commit());
    assert!(errors
        .iter()
        .any(|e| e.contains("'partner'") && e.contains("no super role")));
    assert!(errors
        .iter()
        .any(|e| e.contains("'spouse'") && e.contains("no sub role")));
}

#[test]
fn role_subtyping_satisfies_the_hierarchy_cover() {
    let server = server();
    let session = server.session("hierarchy-ok").expect("session");
    let tx = session.transaction().write().expect("tx");

    let spouse = tx.put_role("spouse").expect("spouse");
    let partner = tx.put_role("partner").expect("partner");
    tx.sup(partner, spouse).expect("partner sub spouse");
    let marriage = tx.put_relation_type("marriage").expect("marriage");
    tx.relates(marriage, spouse).expect("relates spouse");
    let civil = tx.put_relation_type("civil-union").expect("civil");
    tx.sup(civil, marriage).expect("sub marriage");
    tx.relates(civil, partner).expect("relates partner");

    tx.commit().expect("covered hierarchy commits");
}

#[test]
fn casting_requires_the_player_type_to_declare_plays() {
    let server = server();
    let session = server.session("bad-casting").expect("session");
    let tx = session.transaction().write().expect("tx");

    let friend = tx.put_role("friend").expect("friend");
    let friendship = tx.put_relation_type("friendship").expect("friendship");
    tx.relates(friendship, friend).expect("relates");
    let person = tx.put_entity_type("person").expect("person");
    tx.plays(person, friend, false).expect("plays");
    let rock = tx.put_entity_type("rock").expect("rock");

    let pebble = tx.create_entity(rock).expect("pebble");
    let relation = tx.create_relation(friendship).expect("relation");
    tx.add_casting(relation, friend, pebble).expect("casting");

    let errors = expect_validation_errors(tx.commit());
    assert!(errors
        .iter()
        .any(|e| e.contains("not allowed to play role 'friend'")));
}

#[test]
fn casting_role_must_be_related_by_the_relation_type() {
    let server = server();
    let session = server.session("foreign-role").expect("session");
    let tx = session.transaction().write().expect("tx");

    let friend = tx.put_role("friend").expect("friend");
    let rival = tx.put_role("rival").expect("rival");
    let friendship = tx.put_relation_type("friendship").expect("friendship");
    tx.relates(friendship, friend).expect("relates friend");
    let rivalry = tx.put_relation_type("rivalry").expect("rivalry");
    tx.relates(rivalry, rival).expect("relates rival");
    let person = tx.put_entity_type("person").expect("person");
    tx.plays(person, friend, false).expect("plays friend");
    tx.plays(person, rival, false).expect("plays rival");

    let alice = tx.create_entity(person).expect("alice");
    let relation = tx.create_relation(friendship).expect("relation");
    tx.add_casting(relation, rival, alice).expect("casting");

    let errors = expect_validation_errors(tx.commit());
    assert!(errors
        .iter()
        .any(|e| e.contains("which its type does not relate")));
}

#[test]
fn required_role_demands_exactly_one_relation() {
    let server = server();
    let session = server.session("required-role").expect("session");
    let tx = session.transaction().write().expect("tx");

    let holder = tx.put_role("holder").expect("holder");
    let holding = tx.put_relation_type("holding").expect("holding");
    tx.relates(holding, holder).expect("relates");
    let person = tx.put_entity_type("person").expect("person");
    tx.plays(person, holder, true).expect("required plays");

    tx.create_entity(person).expect("lonely person");
    let errors = expect_validation_errors(tx.commit());
    assert!(errors
        .iter()
        .any(|e| e.contains("exactly one relation") && e.contains("plays it in 0")));
}

#[test]
fn key_demands_exactly_one_attribute() {
    let server = server();
    let session = server.session("missing-key").expect("session");
    let tx = session.transaction().write().expect("tx");

    let email = tx
        .put_attribute_type("email", DataType::String)
        .expect("email");
    let person = tx.put_entity_type("person").expect("person");
    tx.key(person, email).expect("key");

    tx.create_entity(person).expect("keyless person");
    let errors = expect_validation_errors(tx.commit());
    assert!(errors
        .iter()
        .any(|e| e.contains("exactly one key attribute") && e.contains("has 0")));
}

#[test]
fn key_values_are_unique_across_the_owner_type() {
    let server = server();
    let session = server.session("dup-key").expect("session");
    let tx = session.transaction().write().expect("tx");

    let email = tx
        .put_attribute_type("email", DataType::String)
        .expect("email");
    let person = tx.put_entity_type("person").expect("person");
    tx.key(person, email).expect("key");

    let value = Value::String("g@example.com".into());
    let attr = tx.create_attribute(email, value).expect("attr");
    let a = tx.create_entity(person).expect("a");
    let b = tx.create_entity(person).expect("b");
    tx.put_ownership(a, attr).expect("a owns");
    tx.put_ownership(b, attr).expect("b owns");

    let errors = expect_validation_errors(tx.commit());
    assert!(errors
        .iter()
        .any(|e| e.contains("key value") && e.contains("2 instances")));
}

#[test]
fn relation_without_role_players_is_rejected() {
    let server = server();
    let session = server.session("empty-relation").expect("session");
    let tx = session.transaction().write().expect("tx");

    let friend = tx.put_role("friend").expect("friend");
    let friendship = tx.put_relation_type("friendship").expect("friendship");
    tx.relates(friendship, friend).expect("relates");
    tx.create_relation(friendship).expect("empty relation");

    let errors = expect_validation_errors(tx.commit());
    assert!(errors.iter().any(|e| e.contains("no role players")));
}

#[test]
fn diagnostics_are_aggregated_across_checks() {
    let server = server();
    let session = server.session("aggregate").expect("session");
    let tx = session.transaction().write().expect("tx");
    let person = tx.put_entity_type("person").expect("person");
    let orphan = tx.put_role("orphan").expect("orphan role");
    tx.plays(person, orphan, false).expect("plays");
    tx.put_relation_type("loose-end").expect("empty relation type");

    let errors = expect_validation_errors(tx.commit());
    assert!(errors.len() >= 2, "expected aggregation, got {errors:?}");
}

#[test]
fn rule_with_disjunction_in_body_is_rejected() {
    let server = server();
    let session = server.session("rule-disjunction").expect("session");
    let tx = session.transaction().write().expect("tx");
    tx.execute("define person sub entity; robot sub entity; name sub attribute, datatype string; ")
        .expect("define base");
    tx.commit().expect("commit base");

    let tx = session.transaction().write().expect("tx");
    tx.execute(
        "define labeled sub rule, \
         when { or { $x isa person; } { $x isa robot; }; }, \
         then { $x has name 'labeled'; };",
    )
    .expect("define rule");
    let errors = expect_validation_errors(tx.commit());
    assert!(errors.iter().any(|e| e.contains("disjunction in its body")));
}

#[test]
fn rule_head_must_be_a_single_atom() {
    let server = server();
    let session = server.session("rule-head").expect("session");
    let tx = session.transaction().write().expect("tx");
    tx.execute(
        "define person sub entity; \
         name sub attribute, datatype string; \
         alias sub attribute, datatype string;",
    )
    .expect("define base");
    tx.commit().expect("commit base");

    let tx = session.transaction().write().expect("tx");
    tx.execute(
        "define double-head sub rule, \
         when { $x isa person; }, \
         then { $x has name 'a'; $x has alias 'b'; };",
    )
    .expect("define rule");
    let errors = expect_validation_errors(tx.commit());
    assert!(errors.iter().any(|e| e.contains("exactly one atom")));
}

#[test]
fn rule_referencing_missing_types_is_rejected() {
    let server = server();
    let session = server.session("rule-missing-type").expect("session");
    let tx = session.transaction().write().expect("tx");
    tx.execute("define name sub attribute, datatype string;")
        .expect("define base");
    tx.commit().expect("commit base");

    let tx = session.transaction().write().expect("tx");
    tx.execute(
        "define ghost-rule sub rule, \
         when { $x isa phantom; }, \
         then { $x has name 'boo'; };",
    )
    .expect("define rule");
    let errors = expect_validation_errors(tx.commit());
    assert!(errors
        .iter()
        .any(|e| e.contains("'phantom'") && e.contains("does not exist")));
}

#[test]
fn negation_closing_a_rule_cycle_is_rejected() {
    let server = server();
    let session = server.session("stratification").expect("session");
    let tx = session.transaction().write().expect("tx");
    tx.execute(
        "define \
         m sub attribute, datatype string; \
         n sub attribute, datatype string; \
         person sub entity, has m, has n;",
    )
    .expect("define base");
    tx.commit().expect("commit base");

    let tx = session.transaction().write().expect("tx");
    tx.execute(
        "define \
         mark-n sub rule, \
         when { $p isa person; not { $p has m 'x'; }; }, \
         then { $p has n 'y'; }; \
         mark-m sub rule, \
         when { $p isa person, has n 'y'; }, \
         then { $p has m 'x'; };",
    )
    .expect("define rules");
    let errors = expect_validation_errors(tx.commit());
    assert!(errors.iter().any(|e| e.contains("not stratifiable")));
}

#[test]
fn stratifiable_rules_commit() {
    let server = server();
    let session = server.session("stratifiable").expect("session");
    let tx = session.transaction().write().expect("tx");
    tx.execute(
        "define \
         score sub attribute, datatype double; \
         grade sub attribute, datatype string; \
         person sub entity, has score, has grade;",
    )
    .expect("define base");
    tx.commit().expect("commit base");

    let tx = session.transaction().write().expect("tx");
    tx.execute(
        "define grade-rule sub rule, \
         when { $p isa person, has score $s; $s >= 1.0; }, \
         then { $p has grade 'pass'; };",
    )
    .expect("define rule");
    tx.commit().expect("stratifiable rule set commits");
}

#[test]
fn failed_validation_closes_the_transaction() {
    let server = server();
    let session = server.session("closes-on-failure").expect("session");
    let tx = session.transaction().write().expect("tx");
    tx.put_relation_type("loose-end").expect("empty relation type");
    let _ = expect_validation_errors(tx.commit());
    assert!(tx.is_closed());
    // The staged mutation is gone; a fresh transaction can commit cleanly.
    let tx = session.transaction().write().expect("tx");
    assert!(tx
        .get_relation_type("loose-end")
        .expect("lookup")
        .is_none());
    tx.commit().expect("clean commit");
}
