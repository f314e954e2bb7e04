mod common;

use common::{
    ActorQuery, CharacterQuery, DbActor, DbCharacter, DbMovie, MovieQuery, ids_in, open_migrated,
    sharded_config,
};
use shardwise::{CallContext, Check, DataError, Database, Id, QueryInterface, Shard};
use tempfile::tempdir;

const TITLES: [(&str, i64); 4] = [
    ("Alien", 1979),
    ("Brazil", 1985),
    ("Cocoon", 1985),
    ("Dune", 1984),
];

/// Two movies on each half of the keyspace. Returns (low ids, high ids).
fn seed(db: &Database) -> (Vec<i64>, Vec<i64>) {
    let low = ids_in("-80", 2);
    let high = ids_in("80-", 2);
    let ctx = CallContext::new("seed");
    db.transacter()
        .allow_cowrites()
        .transaction(&ctx, |session| {
            let ids = [low[0], high[0], low[1], high[1]];
            for ((name, year), id) in TITLES.iter().zip(ids) {
                session.save(&mut DbMovie::new(name, Some(*year)).with_id(id))?;
            }
            Ok(())
        })
        .expect("seed movies");
    (low, high)
}

fn movie_shards(db: &Database) -> Vec<Shard> {
    db.transacter().shards_in("movies").expect("movie shards")
}

#[test]
fn unbound_queries_on_split_keyspaces_are_full_scatters() {
    let dir = tempdir().expect("temp");
    let db = open_migrated(sharded_config(dir.path()));
    seed(&db);
    let ctx = CallContext::new("tests");

    let err = db
        .transaction(&ctx, |session| {
            db.new_query::<MovieQuery>()?.name("Alien").list(session)
        })
        .expect_err("full scatter");
    assert!(matches!(err, DataError::FullScatter { .. }), "{err}");
    assert!(err.is_scale_safety_violation());
    assert!(!err.is_retryable());
    assert_eq!(
        err.to_string(),
        "full scatter: query on movies on keyspace movies is not bound to a shard and would visit all 2 shards"
    );
}

#[test]
fn allowed_scatters_merge_order_and_page() {
    let dir = tempdir().expect("temp");
    let db = open_migrated(sharded_config(dir.path()));
    seed(&db);
    let ctx = CallContext::new("tests");

    let ordered = db
        .transaction(&ctx, |session| {
            db.new_query::<MovieQuery>()?
                .release_date_before(3000)
                .release_date_asc()
                .name_asc()
                .disable_check(Check::FullScatter)
                .names(session)
        })
        .expect("scatter");
    assert_eq!(ordered, vec!["Alien", "Dune", "Brazil", "Cocoon"]);

    let page = db
        .transaction(&ctx, |session| {
            db.new_query::<MovieQuery>()?
                .release_date_before(3000)
                .release_date_asc()
                .name_asc()
                .disable_check(Check::FullScatter)
                .first_result(1)
                .max_rows(2)
                .list(session)
        })
        .expect("page");
    let names: Vec<_> = page.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, vec!["Dune", "Brazil"]);

    let total = db
        .transaction(&ctx, |session| {
            db.new_query::<MovieQuery>()?
                .release_date_before(1985)
                .disable_check(Check::FullScatter)
                .count(session)
        })
        .expect("count");
    assert_eq!(total, 2);
}

#[test]
fn partition_keys_route_to_their_shards() {
    let dir = tempdir().expect("temp");
    let db = open_migrated(sharded_config(dir.path()));
    let (low, high) = seed(&db);
    let ctx = CallContext::new("tests");

    let alien = db
        .transaction(&ctx, |session| {
            db.new_query::<MovieQuery>()?
                .id(Id::new(low[0]))
                .unique_result(session)
        })
        .expect("by id");
    assert_eq!(alien.map(|m| m.name).as_deref(), Some("Alien"));

    let mut both = db
        .transaction(&ctx, |session| {
            db.new_query::<MovieQuery>()?
                .id_in(&[Id::new(low[0]), Id::new(high[0])])
                .names(session)
        })
        .expect("two shards by key");
    both.sort();
    assert_eq!(both, vec!["Alien", "Brazil"]);

    let loaded = db
        .transaction(&ctx, |session| session.load(Id::<DbMovie>::new(high[1])))
        .expect("load routes by id");
    assert_eq!(loaded.name, "Dune");
}

#[test]
fn targeted_sessions_stay_on_their_shard() {
    let dir = tempdir().expect("temp");
    let db = open_migrated(sharded_config(dir.path()));
    seed(&db);
    let ctx = CallContext::new("tests");
    let shards = movie_shards(&db);
    assert_eq!(
        shards.iter().map(ToString::to_string).collect::<Vec<_>>(),
        vec!["movies/-80", "movies/80-"]
    );

    let low_names = db
        .transaction(&ctx, |session| {
            session.target(&shards[0], |session| {
                db.new_query::<MovieQuery>()?
                    .release_date_before(3000)
                    .release_date_asc()
                    .names(session)
            })
        })
        .expect("targeted query");
    assert_eq!(low_names, vec!["Alien", "Cocoon"]);

    let err = db
        .transaction(&ctx, |session| {
            session.target(&shards[0], |session| {
                session.save(&mut DbMovie::new("Misplaced", None).with_id(ids_in("80-", 3)[2]))
            })
        })
        .expect_err("wrong shard");
    assert!(err.is_usage(), "{err}");

    let err = db
        .transaction(&ctx, |session| {
            session.target(&shards[1], |session| {
                db.new_query::<ActorQuery>()?.name("Anyone").list(session)
            })
        })
        .expect_err("other keyspace");
    assert!(err.is_usage(), "{err}");

    let pinned = db
        .transacter()
        .transaction_on_shard(&ctx, &shards[1], |session| {
            db.new_query::<MovieQuery>()?.name("Brazil").names(session)
        })
        .expect("pinned transaction");
    assert_eq!(pinned, vec!["Brazil"]);

    let unknown: Shard = "movies/40-80".parse().expect("shard");
    let err = db
        .transacter()
        .transaction_on_shard(&ctx, &unknown, |_| Ok(()))
        .expect_err("unknown shard");
    assert_eq!(err.to_string(), "unknown shard movies/40-80");
}

#[test]
fn writes_to_two_entity_groups_are_cowrites() {
    let dir = tempdir().expect("temp");
    let db = open_migrated(sharded_config(dir.path()));
    let ctx = CallContext::new("tests");
    let low = ids_in("-80", 2);
    let high = ids_in("80-", 1);

    let err = db
        .transaction(&ctx, |session| {
            session.save(&mut DbMovie::new("First", None).with_id(low[0]))?;
            session.save(&mut DbMovie::new("Second", None).with_id(high[0]))?;
            Ok(())
        })
        .expect_err("two shards");
    assert!(matches!(err, DataError::Cowrite { .. }), "{err}");

    let err = db
        .transaction(&ctx, |session| {
            session.save(&mut DbMovie::new("First", None).with_id(low[0]))?;
            session.save(&mut DbMovie::new("Second", None).with_id(low[1]))?;
            Ok(())
        })
        .expect_err("two groups on one shard");
    assert!(matches!(err, DataError::Cowrite { .. }), "{err}");

    // A root and its children form one group.
    db.transaction(&ctx, |session| {
        let movie = session.save(&mut DbMovie::new("Grouped", None).with_id(low[0]))?;
        session.save(&mut DbCharacter::new(movie, "Lead"))?;
        session.save(&mut DbCharacter::new(movie, "Sidekick"))?;
        Ok(())
    })
    .expect("one group");

    let names = db
        .transaction(&ctx, |session| {
            db.new_query::<CharacterQuery>()?
                .movie_id(Id::new(low[0]))
                .name_asc()
                .names(session)
        })
        .expect("characters");
    assert_eq!(names, vec!["Lead", "Sidekick"]);

    db.transacter()
        .allow_cowrites()
        .transaction(&ctx, |session| {
            session.save(&mut DbMovie::new("Second", None).with_id(low[1]))?;
            session.save(&mut DbMovie::new("Third", None).with_id(high[0]))?;
            Ok(())
        })
        .expect("cowrites allowed");
}

#[test]
fn cowrites_can_be_allowed_for_one_scope() {
    let dir = tempdir().expect("temp");
    let db = open_migrated(sharded_config(dir.path()));
    let ctx = CallContext::new("tests");
    let low = ids_in("-80", 3);
    let high = ids_in("80-", 2);

    db.transaction(&ctx, |session| {
        session.without_checks(&[Check::Cowrite], |session| {
            session.save(&mut DbMovie::new("Left", None).with_id(low[0]))?;
            session.save(&mut DbMovie::new("Right", None).with_id(high[0]))?;
            Ok(())
        })?;
        assert!(session.is_check_enabled(Check::Cowrite));
        Ok(())
    })
    .expect("scoped cowrite");

    let loaded = db
        .transaction(&ctx, |session| {
            session
                .load(Id::<DbMovie>::new(high[0]))
                .map(|movie| movie.name)
        })
        .expect("load");
    assert_eq!(loaded, "Right");

    // Writes after the scope are checked against everything written inside it.
    let err = db
        .transaction(&ctx, |session| {
            session.without_checks(&[Check::Cowrite], |session| {
                session.save(&mut DbMovie::new("Left again", None).with_id(low[1]))?;
                session.save(&mut DbMovie::new("Right again", None).with_id(high[1]))?;
                Ok(())
            })?;
            session.save(&mut DbMovie::new("Another group", None).with_id(low[2]))?;
            Ok(())
        })
        .expect_err("cowrite after scope");
    assert!(matches!(err, DataError::Cowrite { .. }), "{err}");
}

#[test]
fn unsharded_writes_do_not_count_as_groups() {
    let dir = tempdir().expect("temp");
    let db = open_migrated(sharded_config(dir.path()));
    let ctx = CallContext::new("tests");

    db.transaction(&ctx, |session| {
        session.save(&mut DbActor::new("Sigourney Weaver", Some(1949)))?;
        session.save(&mut DbActor::new("Tom Skerritt", Some(1933)))?;
        Ok(())
    })
    .expect("two actors");
}

#[test]
fn deletes_spanning_shards_are_cowrites() {
    let dir = tempdir().expect("temp");
    let db = open_migrated(sharded_config(dir.path()));
    let (low, high) = seed(&db);
    let ctx = CallContext::new("tests");

    let err = db
        .transaction(&ctx, |session| {
            db.new_query::<MovieQuery>()?
                .id_in(&[Id::new(low[0]), Id::new(high[0])])
                .delete(session)
        })
        .expect_err("delete on two shards");
    assert!(matches!(err, DataError::Cowrite { .. }), "{err}");

    let deleted = db
        .transaction(&ctx, |session| {
            db.new_query::<MovieQuery>()?.id(Id::new(high[0])).delete(session)
        })
        .expect("delete on one shard");
    assert_eq!(deleted, 1);

    let remaining = db
        .transacter()
        .replica_read(&ctx, |session| {
            db.new_query::<MovieQuery>()?.release_date_before(3000).count(session)
        })
        .expect("count");
    assert_eq!(remaining, 3);
}

#[test]
fn table_scans_are_rejected_unless_disabled() {
    let dir = tempdir().expect("temp");
    let db = open_migrated(sharded_config(dir.path()));
    let ctx = CallContext::new("tests");
    db.transaction(&ctx, |session| {
        session.save(&mut DbActor::new("Ian Holm", Some(1931)))?;
        session.save(&mut DbActor::new("John Hurt", Some(1940)))?;
        Ok(())
    })
    .expect("seed");

    let err = db
        .transaction(&ctx, |session| {
            db.new_query::<ActorQuery>()?.born_after(1935).list(session)
        })
        .expect_err("scan");
    assert!(matches!(err, DataError::TableScan { .. }), "{err}");
    assert!(err.to_string().contains("actors"), "{err}");

    let by_query = db
        .transaction(&ctx, |session| {
            db.new_query::<ActorQuery>()?
                .born_after(1935)
                .allow_table_scan()
                .list(session)
        })
        .expect("query opt-out");
    assert_eq!(by_query.len(), 1);

    let by_session = db
        .transaction(&ctx, |session| {
            session.disable_checks(&[Check::TableScan], |session| {
                assert!(!session.is_check_enabled(Check::TableScan));
                db.new_query::<ActorQuery>()?.born_after(1935).list(session)
            })
        })
        .expect("session opt-out");
    assert_eq!(by_session.len(), 1);

    let everything = db
        .transaction(&ctx, |session| {
            session.without_checks(&[], |session| {
                db.new_query::<ActorQuery>()?.born_after(1900).count(session)
            })
        })
        .expect("all checks off");
    assert_eq!(everything, 2);

    // The caller's set is restored once the scope ends.
    let err = db
        .transaction(&ctx, |session| {
            session.without_checks(&[Check::Cowrite], |_| Ok(()))?;
            db.new_query::<ActorQuery>()?.born_after(1935).list(session)
        })
        .expect_err("scan after scope");
    assert!(matches!(err, DataError::TableScan { .. }));

    let indexed = db
        .transaction(&ctx, |session| {
            db.new_query::<ActorQuery>()?
                .name_in(&["Ian Holm", "John Hurt"])
                .name_asc()
                .list(session)
        })
        .expect("indexed lookup");
    assert_eq!(indexed.len(), 2);
}

#[test]
fn full_index_traversals_count_as_table_scans() {
    let dir = tempdir().expect("temp");
    let db = open_migrated(sharded_config(dir.path()));
    let ctx = CallContext::new("tests");
    db.transaction(&ctx, |session| {
        session.save(&mut DbActor::new("Veronica Cartwright", Some(1949)))?;
        session.save(&mut DbActor::new("Harry Dean Stanton", Some(1926)))?;
        Ok(())
    })
    .expect("seed");

    // Reading every row in index order is still a scan of the table.
    let err = db
        .transaction(&ctx, |session| {
            db.new_query::<ActorQuery>()?.name_asc().list(session)
        })
        .expect_err("ordered scan");
    assert!(matches!(err, DataError::TableScan { .. }), "{err}");
    assert!(err.to_string().contains("actors"), "{err}");

    let err = db
        .transaction(&ctx, |session| db.new_query::<ActorQuery>()?.count(session))
        .expect_err("unfiltered count");
    assert!(matches!(err, DataError::TableScan { .. }), "{err}");

    let names: Vec<_> = db
        .transaction(&ctx, |session| {
            db.new_query::<ActorQuery>()?
                .name_asc()
                .allow_table_scan()
                .list(session)
        })
        .expect("scan allowed")
        .into_iter()
        .map(|actor| actor.name)
        .collect();
    assert_eq!(names, vec!["Harry Dean Stanton", "Veronica Cartwright"]);

    let found = db
        .transaction(&ctx, |session| {
            db.new_query::<ActorQuery>()?
                .name("Harry Dean Stanton")
                .name_asc()
                .list(session)
        })
        .expect("index search");
    assert_eq!(found.len(), 1);
}

#[test]
fn nested_check_scopes_replace_and_restore() {
    let dir = tempdir().expect("temp");
    let db = open_migrated(sharded_config(dir.path()));
    let ctx = CallContext::new("tests");
    db.transaction(&ctx, |session| {
        session.save(&mut DbActor::new("Ian Holm", Some(1931)))?;
        session.save(&mut DbActor::new("John Hurt", Some(1940)))?;
        Ok(())
    })
    .expect("seed");

    let outer = db
        .transaction(&ctx, |session| {
            session.without_checks(&[Check::TableScan], |session| {
                assert!(!session.is_check_enabled(Check::TableScan));
                session.without_checks(&[Check::Cowrite], |session| {
                    assert!(session.is_check_enabled(Check::TableScan));
                    assert!(!session.is_check_enabled(Check::Cowrite));
                    let err = db
                        .new_query::<ActorQuery>()?
                        .born_after(1935)
                        .list(session)
                        .expect_err("scan in inner scope");
                    assert!(matches!(err, DataError::TableScan { .. }), "{err}");
                    Ok(())
                })?;
                assert!(!session.is_check_enabled(Check::TableScan));
                assert!(session.is_check_enabled(Check::Cowrite));
                db.new_query::<ActorQuery>()?.born_after(1935).list(session)
            })
        })
        .expect("outer scope");
    assert_eq!(outer.len(), 1);
}

#[test]
fn raw_statements_pass_through_the_checks() {
    let dir = tempdir().expect("temp");
    let db = open_migrated(sharded_config(dir.path()));
    seed(&db);
    let ctx = CallContext::new("tests");
    let shards = movie_shards(&db);

    let err = db
        .transaction(&ctx, |session| {
            session.use_connection(|c| c.query("SELECT name FROM movies WHERE name = ?", &["Alien".into()]))
        })
        .expect_err("untargeted raw query");
    assert!(matches!(err, DataError::FullScatter { .. }), "{err}");

    let err = db
        .transaction(&ctx, |session| {
            session.target(&shards[0], |session| {
                session.use_connection(|c| c.query("SELECT name FROM movies WHERE rating IS NULL", &[]))
            })
        })
        .expect_err("raw scan");
    assert!(matches!(err, DataError::TableScan { .. }), "{err}");

    let rows = db
        .transaction(&ctx, |session| {
            session.target(&shards[1], |session| {
                session.use_connection(|c| {
                    assert_eq!(c.shard().as_ref(), Some(&shards[1]));
                    c.query("SELECT name FROM movies WHERE name = ?", &["Brazil".into()])
                })
            })
        })
        .expect("targeted raw query");
    assert_eq!(rows.len(), 1);
}

#[test]
fn replica_reads_may_scatter_but_not_write() {
    let dir = tempdir().expect("temp");
    let db = open_migrated(sharded_config(dir.path()));
    seed(&db);
    let ctx = CallContext::new("tests");

    let mut names = db
        .transacter()
        .replica_read(&ctx, |session| {
            db.new_query::<MovieQuery>()?.release_date_before(1985).names(session)
        })
        .expect("replica scatter");
    names.sort();
    assert_eq!(names, vec!["Alien", "Dune"]);

    let err = db
        .transacter()
        .replica_read(&ctx, |session| {
            session.save(&mut DbMovie::new("Nope", None).with_id(ids_in("-80", 5)[4]))
        })
        .expect_err("write on replica");
    assert!(err.is_usage(), "{err}");
}

#[test]
fn shard_lists_are_cached() {
    let dir = tempdir().expect("temp");
    let db = open_migrated(sharded_config(dir.path()));
    let before = db.transacter().shard_list_fetches();
    assert_eq!(before, 1);

    let shards = db.transacter().shards().expect("shards");
    assert_eq!(shards.len(), 3);
    db.transacter().shards_in("movies").expect("movies");
    assert_eq!(db.transacter().shard_list_fetches(), 1);

    db.transacter().refresh_shards();
    let again = db.transacter().shards().expect("shards");
    assert_eq!(again, shards);
    assert_eq!(db.transacter().shard_list_fetches(), 2);
}
