use cairn::{CairnError, Config, DataType, Server, Value};

fn server() -> Server {
    Server::new(Config::default())
}

#[test]
fn put_and_get_schema_concepts_by_label() {
    let server = server();
    let session = server.session("labels").expect("session");
    let tx = session.transaction().write().expect("tx");

    assert!(tx.get_entity_type("my-entity").expect("lookup").is_none());
    assert!(tx.get_relation_type("my-relation").expect("lookup").is_none());
    assert!(tx.get_role("my-role").expect("lookup").is_none());
    assert!(tx.get_attribute_type("my-attribute").expect("lookup").is_none());
    assert!(tx.get_rule("my-rule").expect("lookup").is_none());

    let entity = tx.put_entity_type("my-entity").expect("put entity");
    let relation = tx.put_relation_type("my-relation").expect("put relation");
    let role = tx.put_role("my-role").expect("put role");
    let attribute = tx
        .put_attribute_type("my-attribute", DataType::String)
        .expect("put attribute");

    assert_eq!(tx.get_entity_type("my-entity").expect("lookup"), Some(entity));
    assert_eq!(
        tx.concept_label(entity).expect("label"),
        Some("my-entity".to_string())
    );
    assert_eq!(
        tx.get_relation_type("my-relation").expect("lookup"),
        Some(relation)
    );
    assert_eq!(tx.get_role("my-role").expect("lookup"), Some(role));
    assert_eq!(
        tx.get_attribute_type("my-attribute").expect("lookup"),
        Some(attribute)
    );
    tx.close();
}

#[test]
fn put_is_create_or_fetch() {
    let server = server();
    let session = server.session("put-twice").expect("session");
    let tx = session.transaction().write().expect("tx");
    let first = tx.put_entity_type("person").expect("first put");
    let second = tx.put_entity_type("person").expect("second put");
    assert_eq!(first, second);
    tx.close();
}

#[test]
fn attributes_by_value_span_attribute_types() {
    let server = server();
    let session = server.session("by-value").expect("session");
    let tx = session.transaction().write().expect("tx");

    let target = Value::String("Geralt".into());
    assert!(tx.get_attributes_by_value(&target).expect("scan").is_empty());

    let t1 = tx
        .put_attribute_type("first-name", DataType::String)
        .expect("t1");
    let t2 = tx
        .put_attribute_type("nickname", DataType::String)
        .expect("t2");
    let r1 = tx.create_attribute(t1, target.clone()).expect("r1");
    let r2 = tx.create_attribute(t2, target.clone()).expect("r2");
    tx.create_attribute(t2, Value::String("Dragon".into()))
        .expect("unrelated attribute");

    let found = tx.get_attributes_by_value(&target).expect("scan");
    assert_eq!(found, vec![r1, r2]);
    assert_eq!(tx.thing_type(r1).expect("type"), Some(t1));
    assert_eq!(tx.attribute_value(r2).expect("value"), Some(target));
    tx.close();
}

#[test]
fn attribute_instances_are_unique_per_type_and_value() {
    let server = server();
    let session = server.session("attr-dedup").expect("session");
    let tx = session.transaction().write().expect("tx");
    let t = tx.put_attribute_type("name", DataType::String).expect("type");
    let a = tx
        .create_attribute(t, Value::String("Yen".into()))
        .expect("first");
    let b = tx
        .create_attribute(t, Value::String("Yen".into()))
        .expect("second");
    assert_eq!(a, b);
    tx.close();
}

#[test]
fn sups_of_a_type_end_at_the_meta_root() {
    let server = server();
    let session = server.session("sups").expect("session");
    let tx = session.transaction().write().expect("tx");
    let yes = tx.put_entity_type("yes").expect("put");
    let meta_entity = tx.get_schema_concept("entity").expect("meta").expect("entity");
    let meta_thing = tx.get_schema_concept("thing").expect("meta").expect("thing");

    let sups = tx.sups(yes).expect("sups");
    assert_eq!(sups, vec![yes, meta_entity, meta_thing]);
    assert_eq!(
        tx.sups(meta_entity).expect("sups"),
        vec![meta_entity, meta_thing]
    );
    assert_eq!(tx.sups(meta_thing).expect("sups"), vec![meta_thing]);
    tx.close();
}

#[test]
fn sharding_threshold_reports_configured_value() {
    let server = server();
    let session = server.session("threshold").expect("session");
    let tx = session.transaction().write().expect("tx");
    assert_eq!(10_000, tx.sharding_threshold());
    tx.close();
}

#[test]
fn closed_transaction_is_not_usable() {
    let server = server();
    let session = server.session("closed-tx").expect("session");
    let tx = session.transaction().write().expect("tx");
    tx.close();
    match tx.get_schema_concept("thing") {
        Err(CairnError::TransactionClosed { .. }) => {}
        other => panic!("expected transaction-closed error, got {other:?}"),
    }
}

#[test]
fn check_mutation_allowed_rejects_read_mode() {
    let server = server();
    let session = server.session("read-mode").expect("session");

    let tx1 = session.transaction().read().expect("read tx");
    assert!(matches!(
        tx1.check_mutation_allowed(),
        Err(CairnError::ReadOnly { .. })
    ));
    tx1.close();

    let tx2 = session.transaction().write().expect("write tx");
    tx2.check_mutation_allowed().expect("write allows mutation");
    tx2.close();
}

#[test]
fn commit_and_close_are_idempotent() {
    let server = server();
    let session = server.session("idempotent").expect("session");
    let tx = session.transaction().write().expect("tx");
    tx.commit().expect("commit");
    assert!(tx.is_closed());
    tx.commit().expect("second commit is a no-op");
    tx.close();
    assert!(tx.is_closed());
}

#[test]
fn read_transaction_with_staged_schema_fails_commit() {
    let server = server();
    let session = server.session("read-commit").expect("session");
    for put in ["an-entity", "a-role", "a-relation"] {
        let tx = session.transaction().read().expect("read tx");
        match put {
            "a-role" => {
                tx.put_role(put).expect("staged in read mode");
            }
            "a-relation" => {
                tx.put_relation_type(put).expect("staged in read mode");
            }
            _ => {
                tx.put_entity_type(put).expect("staged in read mode");
            }
        }
        match tx.commit() {
            Err(CairnError::ReadOnlyCommit { .. }) => {}
            other => panic!("expected read-only commit error, got {other:?}"),
        }
        assert!(tx.is_closed());
    }
}

#[test]
fn read_transaction_with_staged_instances_fails_commit() {
    let server = server();
    let session = server.session("read-insert").expect("session");
    let tx = session.transaction().write().expect("write tx");
    let person = tx.put_entity_type("person").expect("put");
    tx.commit().expect("commit schema");

    let tx = session.transaction().read().expect("read tx");
    tx.create_entity(person).expect("staged in read mode");
    match tx.commit() {
        Err(CairnError::ReadOnlyCommit { .. }) => {}
        other => panic!("expected read-only commit error, got {other:?}"),
    }
}

#[test]
fn manual_sharding_routes_new_instances_to_new_shards() {
    let server = server();
    let session = server.session("shards").expect("session");
    let tx = session.transaction().write().expect("tx");
    let entity_type = tx.put_entity_type("the-special-type").expect("put");
    let s1 = tx.current_shard(entity_type).expect("shard 1");

    let s1_members = [
        tx.create_entity(entity_type).expect("e1"),
        tx.create_entity(entity_type).expect("e2"),
        tx.create_entity(entity_type).expect("e3"),
    ];
    tx.shard(entity_type).expect("open shard 2");
    let s2 = tx.current_shard(entity_type).expect("shard 2");

    let s2_members = [
        tx.create_entity(entity_type).expect("e4"),
        tx.create_entity(entity_type).expect("e5"),
        tx.create_entity(entity_type).expect("e6"),
        tx.create_entity(entity_type).expect("e7"),
        tx.create_entity(entity_type).expect("e8"),
    ];
    tx.shard(entity_type).expect("open shard 3");
    let s3 = tx.current_shard(entity_type).expect("shard 3");

    let s3_members = [
        tx.create_entity(entity_type).expect("e9"),
        tx.create_entity(entity_type).expect("e10"),
    ];

    let shards = tx.shards(entity_type).expect("shards");
    assert_eq!(
        shards.iter().map(|s| s.id).collect::<Vec<_>>(),
        vec![s1, s2, s3]
    );
    assert_eq!(shards[0].members, s1_members);
    assert_eq!(shards[1].members, s2_members);
    assert_eq!(shards[2].members, s3_members);
    tx.close();
}

#[test]
fn shard_counts_grow_with_manual_shards() {
    let server = server();
    let session = server.session("shard-count").expect("session");
    let tx = session.transaction().write().expect("tx");
    let entity = tx.put_entity_type("amazing-entity-type").expect("put");
    assert_eq!(1, tx.shard_count(entity).expect("count"));
    tx.shard(entity).expect("shard");
    assert_eq!(2, tx.shard_count(entity).expect("count"));
    tx.close();
}

#[test]
fn crossing_the_sharding_threshold_opens_shards_automatically() {
    let config = Config {
        sharding_threshold: 3,
        ..Config::default()
    };
    let server = Server::new(config);
    let session = server.session("auto-shard").expect("session");
    let tx = session.transaction().write().expect("tx");
    let entity = tx.put_entity_type("busy-type").expect("put");

    let mut created = Vec::new();
    for _ in 0..8 {
        created.push(tx.create_entity(entity).expect("create"));
    }

    let shards = tx.shards(entity).expect("shards");
    assert_eq!(shards.len(), 3);
    // Old shards froze at the threshold; each instance sits in exactly one.
    assert_eq!(shards[0].members.len(), 3);
    assert_eq!(shards[1].members.len(), 3);
    assert_eq!(shards[2].members.len(), 2);
    let mut all: Vec<_> = shards.iter().flat_map(|s| s.members.clone()).collect();
    all.sort_unstable();
    assert_eq!(all, created);
    tx.commit().expect("commit");
}

#[test]
fn id_allocation_spans_blocks_through_the_stack() {
    let server = Server::new(Config::small_blocks());
    let session = server.session("small-blocks").expect("session");
    let tx = session.transaction().write().expect("tx");
    let person = tx.put_entity_type("person").expect("put");
    let mut last = 0;
    // Enough instances to drain several 16-id authority blocks.
    for _ in 0..100 {
        let id = tx.create_entity(person).expect("create");
        assert!(id > last);
        last = id;
    }
    tx.commit().expect("commit");
}

#[test]
fn schema_built_across_threads_passes_validation() {
    let server = server();
    let session = server.session("threaded-schema").expect("session");

    std::thread::scope(|scope| {
        scope
            .spawn(|| {
                let tx = session.transaction().write().expect("tx");
                let int_ = tx.put_attribute_type("int", DataType::Long).expect("int");
                let foo = tx.put_attribute_type("foo", DataType::Long).expect("foo");
                tx.sup(foo, int_).expect("foo sub int");
                let bar = tx.put_attribute_type("bar", DataType::Long).expect("bar");
                tx.sup(bar, int_).expect("bar sub int");
                let foo_owner = tx.put_entity_type("FOO").expect("FOO");
                tx.has(foo_owner, foo).expect("FOO has foo");
                tx.commit().expect("commit");
            })
            .join()
            .expect("schema thread");
    });

    let tx = session.transaction().write().expect("tx");
    let bar = tx.get_attribute_type("bar").expect("lookup").expect("bar");
    let bar_owner = tx.put_entity_type("BAR").expect("BAR");
    tx.has(bar_owner, bar).expect("BAR has bar");
    tx.commit().expect("commit");
}

#[test]
fn insert_and_delete_relation_in_same_transaction() {
    let server = server();
    let session = server.session("rel-lifecycle").expect("session");

    let tx = session.transaction().write().expect("tx");
    tx.execute("define person sub entity, plays friend; friendship sub relation, relates friend;")
        .expect("define");
    tx.commit().expect("commit schema");

    let tx = session.transaction().write().expect("tx");
    let maps = tx
        .execute("insert $x isa person; $y isa person; $r (friend: $x, friend: $y) isa friendship;")
        .expect("insert")
        .maps();
    let rel_id = maps[0].get("r").expect("relation id");
    tx.execute(&format!("match $r id {rel_id}; delete $r;"))
        .expect("delete");
    tx.commit().expect("commit");

    let tx = session.transaction().write().expect("tx");
    let people = tx.execute("match $x isa person; get;").expect("get people");
    assert_eq!(2, people.count());
    let relations = tx
        .execute(&format!("match $r id {rel_id}; get;"))
        .expect("get relation");
    assert_eq!(0, relations.count());
    tx.close();
}

#[test]
fn insert_and_delete_relation_in_different_transactions() {
    let server = server();
    let session = server.session("rel-lifecycle-2").expect("session");

    let tx = session.transaction().write().expect("tx");
    tx.execute("define person sub entity, plays friend; friendship sub relation, relates friend;")
        .expect("define");
    tx.commit().expect("commit schema");

    let tx = session.transaction().write().expect("tx");
    let maps = tx
        .execute("insert $x isa person; $y isa person; $r (friend: $x, friend: $y) isa friendship;")
        .expect("insert")
        .maps();
    let rel_id = maps[0].get("r").expect("relation id");
    tx.commit().expect("commit insert");

    let tx = session.transaction().write().expect("tx");
    tx.execute(&format!("match $r id {rel_id}; delete $r;"))
        .expect("delete");
    tx.commit().expect("commit delete");

    let tx = session.transaction().write().expect("tx");
    assert_eq!(2, tx.execute("match $x isa person; get;").expect("get").count());
    assert_eq!(
        0,
        tx.execute(&format!("match $r id {rel_id}; get;"))
            .expect("get")
            .count()
    );
    tx.close();
}

#[test]
fn inferred_concepts_are_not_persisted() {
    let server = server();
    let session = server.session("inference").expect("session");

    let tx = session.transaction().write().expect("tx");
    tx.execute(
        "define \
         name sub attribute, datatype string; \
         score sub attribute, datatype double; \
         person sub entity, has name, has score; \
         infer-attr sub rule, \
         when { $p isa person, has score $s; $s > 0.0; }, \
         then { $p has name 'Ganesh'; };",
    )
    .expect("define");
    tx.commit().expect("commit schema");

    let tx = session.transaction().write().expect("tx");
    tx.execute("insert $p isa person, has score 10.0;").expect("insert");
    tx.commit().expect("commit insert");

    let tx = session.transaction().write().expect("tx");
    let inferred = tx
        .execute("match $p isa person, has name $n; get;")
        .expect("get with inference");
    assert_eq!(1, inferred.count());
    tx.commit().expect("commit discards inference");

    let tx = session.transaction().read().expect("read tx");
    let persisted = tx
        .execute_with_inference("match $p isa person, has name $n; get;", false)
        .expect("get without inference");
    assert_eq!(0, persisted.count());
    tx.close();
}

#[test]
fn inferred_attribute_edges_are_not_persisted() {
    let server = server();
    let session = server.session("inferred-edge").expect("session");

    let tx = session.transaction().write().expect("tx");
    tx.execute(
        "define \
         score sub attribute, datatype double; \
         person sub entity, has score; \
         spread-score sub rule, \
         when { $p isa person, has score $s; $q isa person; $q != $p; }, \
         then { $q has score $s; };",
    )
    .expect("define");
    tx.commit().expect("commit schema");

    let tx = session.transaction().write().expect("tx");
    tx.execute("insert $p isa person, has score 10.0;").expect("insert p");
    tx.execute("insert $q isa person;").expect("insert q");
    tx.commit().expect("commit inserts");

    let tx = session.transaction().write().expect("tx");
    let with_inference = tx
        .execute("match $p isa person, has score $s; get;")
        .expect("get with inference");
    assert_eq!(2, with_inference.count());
    tx.commit().expect("commit");

    let tx = session.transaction().read().expect("read tx");
    let persisted = tx
        .execute_with_inference("match $p isa person, has score $s; get;", false)
        .expect("get without inference");
    assert_eq!(1, persisted.count());
    tx.close();
}

#[test]
fn rule_head_with_undeclared_ownership_fails_inference() {
    let server = server();
    let session = server.session("nonconforming-rule").expect("session");

    let tx = session.transaction().write().expect("tx");
    tx.execute(
        "define \
         name sub attribute, datatype string; \
         person sub entity, has name; \
         dog sub entity; \
         name-dogs sub rule, \
         when { $d isa dog; }, \
         then { $d has name 'Rex'; };",
    )
    .expect("define");
    tx.commit().expect("commit schema");

    let tx = session.transaction().write().expect("tx");
    tx.execute("insert $d isa dog;").expect("insert");
    tx.commit().expect("commit insert");

    // `dog` never declares `has name`; applying the rule must surface the
    // same diagnostic a direct insert would, not stage a violating edge.
    let tx = session.transaction().write().expect("tx");
    match tx.execute("match $d isa dog, has name $n; get;") {
        Err(CairnError::InvalidArgument(message)) => {
            assert!(message.contains("does not declare ownership"));
        }
        other => panic!("expected ownership conformance error, got {other:?}"),
    }
    tx.close();

    // Without inference the same query simply finds nothing.
    let tx = session.transaction().read().expect("read tx");
    let answers = tx
        .execute_with_inference("match $d isa dog, has name $n; get;", false)
        .expect("get without inference");
    assert_eq!(0, answers.count());
    tx.close();
}

fn define_relation_inference_schema(session: &cairn::Session) {
    let tx = session.transaction().write().expect("tx");
    tx.execute(
        "define \
         inferrable sub attribute, datatype string, plays another-role; \
         tag sub attribute, datatype string; \
         base-entity sub entity, has inferrable, plays some-role; \
         inferred-relation sub relation, relates some-role, relates another-role, has tag; \
         infer-attr sub rule, \
         when { $p isa base-entity; }, \
         then { $p has inferrable 'inferred'; }; \
         infer-relation sub rule, \
         when { $p isa base-entity; $q isa base-entity, has inferrable $r; }, \
         then { (some-role: $p, another-role: $r) isa inferred-relation; };",
    )
    .expect("define");
    tx.commit().expect("commit schema");
}

#[test]
fn inferred_relations_are_not_persisted() {
    let server = server();
    let session = server.session("inferred-relation").expect("session");
    define_relation_inference_schema(&session);

    let tx = session.transaction().write().expect("tx");
    tx.execute("insert $p isa base-entity;").expect("insert");
    tx.commit().expect("commit insert");

    let tx = session.transaction().write().expect("tx");
    let inferred = tx
        .execute("match $rel (some-role: $x, another-role: $r) isa inferred-relation; get;")
        .expect("get with inference");
    assert_eq!(1, inferred.count());
    tx.commit().expect("commit discards inference");

    let tx = session.transaction().read().expect("read tx");
    let persisted = tx
        .execute_with_inference(
            "match $rel (some-role: $x, another-role: $r) isa inferred-relation; get;",
            false,
        )
        .expect("get without inference");
    assert_eq!(0, persisted.count());
    tx.close();
}

#[test]
fn concepts_depending_on_inferred_relations_are_persisted() {
    let server = server();
    let session = server.session("inferred-relation-deps").expect("session");
    define_relation_inference_schema(&session);

    let tx = session.transaction().write().expect("tx");
    tx.execute("insert $p isa base-entity;").expect("insert");
    tx.commit().expect("commit insert");

    // Attach a user-asserted attribute to the inferred relation; the
    // relation and its inferred role player must be persisted with it,
    // while the inferred ownership edge on the entity must not.
    let tx = session.transaction().write().expect("tx");
    let inserted = tx
        .execute(
            "match $rel (some-role: $p, another-role: $r) isa inferred-relation; \
             insert $rel has tag 'kept';",
        )
        .expect("match-insert")
        .maps();
    assert_eq!(1, inserted.len());
    tx.commit().expect("commit");

    let tx = session.transaction().read().expect("read tx");
    let relations = tx
        .execute_with_inference(
            "match $rel (some-role: $p, another-role: $r) isa inferred-relation; get;",
            false,
        )
        .expect("get relations");
    assert_eq!(1, relations.count());
    let tagged = tx
        .execute_with_inference("match $rel isa inferred-relation, has tag $t; get;", false)
        .expect("get tagged");
    assert_eq!(1, tagged.count());
    let ownerships = tx
        .execute_with_inference("match $q isa base-entity, has inferrable $r; get;", false)
        .expect("get ownerships");
    assert_eq!(0, ownerships.count());
    tx.close();
}

#[test]
fn concepts_depending_on_inferred_concepts_are_persisted() {
    let server = server();
    let session = server.session("inferred-deps").expect("session");

    let tx = session.transaction().write().expect("tx");
    tx.execute(
        "define \
         inferrable sub attribute, datatype string, plays another-role; \
         base-entity sub entity, has inferrable, plays some-role; \
         inferrable-relation sub relation, relates some-role, relates another-role; \
         infer-attr sub rule, \
         when { $p isa base-entity; }, \
         then { $p has inferrable 'inferred'; };",
    )
    .expect("define");
    tx.commit().expect("commit schema");

    let tx = session.transaction().write().expect("tx");
    tx.execute("insert $p isa base-entity;").expect("insert");
    tx.commit().expect("commit insert");

    // Reference the inferred attribute from a user-inserted relation; the
    // attribute must be persisted with it, the inferred ownership must not.
    let tx = session.transaction().write().expect("tx");
    let inserted = tx
        .execute(
            "match $q isa base-entity, has inferrable $r; \
             insert $rel (some-role: $q, another-role: $r) isa inferrable-relation;",
        )
        .expect("match-insert")
        .maps();
    assert_eq!(1, inserted.len());
    tx.commit().expect("commit");

    let tx = session.transaction().read().expect("read tx");
    let relations = tx
        .execute_with_inference(
            "match $rel (some-role: $p, another-role: $r) isa inferrable-relation; get;",
            false,
        )
        .expect("get relations");
    assert_eq!(1, relations.count());
    let ownerships = tx
        .execute_with_inference("match $q isa base-entity, has inferrable $r; get;", false)
        .expect("get ownerships");
    assert_eq!(0, ownerships.count());
    tx.close();
}
