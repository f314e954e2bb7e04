mod common;

use common::{DbMovie, NameAndReleaseDate};
use shardwise::query::{Annotation, MethodDecl, ParamShape};
use shardwise::{
    DataError, DataErrorCode, Operator, Projection, ProjectionDecl, QueryDeclaration,
    QueryExecutor, QueryFactory, QueryInterface, ResultKind, ReturnShape,
};

struct BrokenMovieQuery(QueryExecutor<DbMovie>);

impl QueryInterface for BrokenMovieQuery {
    type Entity = DbMovie;

    fn declare() -> QueryDeclaration {
        QueryDeclaration::new("BrokenMovieQuery")
            .constraint("name", "name", Operator::Eq)
            .method(MethodDecl::new("unannotated"))
            .method(
                MethodDecl::new("ids")
                    .annotated(Annotation::Constraint {
                        path: "id".into(),
                        operator: Operator::In,
                    })
                    .param(ParamShape::Value("Long".into())),
            )
            .method(
                MethodDecl::new("bad_path")
                    .annotated(Annotation::Order {
                        path: "release date".into(),
                        asc: true,
                    }),
            )
            .method(
                MethodDecl::new("names_without_session")
                    .annotated(Annotation::Select {
                        path: "name".into(),
                    })
                    .returns(ReturnShape::list_of(ResultKind::Value("String".into()))),
            )
            .method(
                MethodDecl::new("orphan_projection")
                    .annotated(Annotation::Select { path: String::new() })
                    .param(ParamShape::Session)
                    .returns(ReturnShape::list_of(ResultKind::Projection(
                        ProjectionDecl::new("Orphan").property("name").unannotated(),
                    ))),
            )
    }

    fn from_executor(executor: QueryExecutor<DbMovie>) -> Self {
        Self(executor)
    }

    fn executor(&self) -> &QueryExecutor<DbMovie> {
        &self.0
    }

    fn executor_mut(&mut self) -> &mut QueryExecutor<DbMovie> {
        &mut self.0
    }
}

#[test]
fn broken_declarations_report_every_problem() {
    let factory = QueryFactory::default();
    let err = factory
        .new_query::<BrokenMovieQuery>()
        .err()
        .expect("declaration problems");
    assert_eq!(err.code(), DataErrorCode::InvalidQueryDeclaration);
    let DataError::InvalidQueryDeclaration { query, problems } = &err else {
        panic!("unexpected error {err}");
    };
    assert_eq!(query, "BrokenMovieQuery");
    assert_eq!(
        problems,
        &vec![
            "bad_path() path is not valid: 'release date'".to_string(),
            "ids() parameter must be a vararg or a collection".to_string(),
            "names_without_session() must accept a single Session parameter".to_string(),
            "Orphan parameter 1 is missing a @Property annotation".to_string(),
            "unannotated() must be annotated @Constraint, @Order or @Select".to_string(),
        ]
    );
    assert!(err.to_string().starts_with("Query class BrokenMovieQuery has problems:\n  bad_path()"));

    // Failures are not cached; every attempt recompiles and fails again.
    assert!(factory.new_query::<BrokenMovieQuery>().is_err());
    assert_eq!(factory.compilations(), 0);
}

#[test]
fn projections_declare_their_paths() {
    let decl = NameAndReleaseDate::declaration();
    assert_eq!(decl.name, "NameAndReleaseDate");
    assert_eq!(
        decl.properties,
        vec![Some("name".to_string()), Some("release.date".to_string())]
    );
}
