pub mod descriptor;
pub mod executor;
pub mod factory;
pub mod plan;

pub use descriptor::{
    Annotation, MethodDecl, MethodHandler, Operator, ParamShape, ProjectionDecl, QueryDeclaration,
    QueryDescriptor, ResultKind, ReturnShape,
};
pub use executor::{Args, OrBuilder, PredicateFactory, Projection, QueryExecutor};
pub use factory::{QueryFactory, QueryInterface};
pub use plan::{Expr, Order, Statement, StatementKind, col};
