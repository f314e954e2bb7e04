use crate::entity::is_valid_path;
use crate::error::{DataError, DataResult};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Lt,
    Le,
    Eq,
    /// Equal to the argument, or `IS NULL` when the argument is null.
    EqOrIsNull,
    Ge,
    Gt,
    Ne,
    In,
    NotIn,
    IsNotNull,
    IsNull,
}

impl Operator {
    pub fn arity(self) -> usize {
        match self {
            Operator::IsNull | Operator::IsNotNull => 0,
            _ => 1,
        }
    }

    pub fn takes_collection(self) -> bool {
        matches!(self, Operator::In | Operator::NotIn)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operator::Lt => "LT",
            Operator::Le => "LE",
            Operator::Eq => "EQ",
            Operator::EqOrIsNull => "EQ_OR_IS_NULL",
            Operator::Ge => "GE",
            Operator::Gt => "GT",
            Operator::Ne => "NE",
            Operator::In => "IN",
            Operator::NotIn => "NOT_IN",
            Operator::IsNotNull => "IS_NOT_NULL",
            Operator::IsNull => "IS_NULL",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Annotation {
    Constraint { path: String, operator: Operator },
    Order { path: String, asc: bool },
    /// An empty path selects a whole projection from the root.
    Select { path: String },
}

/// Declared type of one method parameter. Type names are only used in
/// problem reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamShape {
    Value(String),
    Collection(String),
    Varargs(String),
    Session,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectionDecl {
    pub name: String,
    pub primary_constructor: bool,
    /// Path of each constructor parameter, `None` where it is missing.
    pub properties: Vec<Option<String>>,
}

impl ProjectionDecl {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_constructor: true,
            properties: Vec::new(),
        }
    }

    pub fn without_primary_constructor(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_constructor: false,
            properties: Vec::new(),
        }
    }

    pub fn property(mut self, path: impl Into<String>) -> Self {
        self.properties.push(Some(path.into()));
        self
    }

    pub fn unannotated(mut self) -> Self {
        self.properties.push(None);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultKind {
    Value(String),
    Projection(ProjectionDecl),
}

impl ResultKind {
    fn type_name(&self) -> &str {
        match self {
            ResultKind::Value(name) => name,
            ResultKind::Projection(decl) => &decl.name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReturnShape {
    This,
    Other(String),
    List { element: ResultKind, nullable: bool },
    Single { element: ResultKind, nullable: bool },
}

impl ReturnShape {
    pub fn list_of(element: ResultKind) -> Self {
        ReturnShape::List {
            element,
            nullable: false,
        }
    }

    pub fn nullable(element: ResultKind) -> Self {
        ReturnShape::Single {
            element,
            nullable: true,
        }
    }

    fn type_name(&self, query: &str) -> String {
        match self {
            ReturnShape::This => query.to_string(),
            ReturnShape::Other(name) => name.clone(),
            ReturnShape::List { element, .. } => format!("List<{}>", element.type_name()),
            ReturnShape::Single { element, .. } => element.type_name().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDecl {
    pub name: String,
    pub annotations: Vec<Annotation>,
    pub params: Vec<ParamShape>,
    pub returns: ReturnShape,
}

impl MethodDecl {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            annotations: Vec::new(),
            params: Vec::new(),
            returns: ReturnShape::This,
        }
    }

    pub fn annotated(mut self, annotation: Annotation) -> Self {
        self.annotations.push(annotation);
        self
    }

    pub fn param(mut self, shape: ParamShape) -> Self {
        self.params.push(shape);
        self
    }

    pub fn returns(mut self, shape: ReturnShape) -> Self {
        self.returns = shape;
        self
    }
}

/// Registration of a query type: every method it exposes with its
/// annotation, parameters and return shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryDeclaration {
    pub name: String,
    pub methods: Vec<MethodDecl>,
}

impl QueryDeclaration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
        }
    }

    pub fn method(mut self, method: MethodDecl) -> Self {
        self.methods.push(method);
        self
    }

    pub fn constraint(self, method: &str, path: &str, operator: Operator) -> Self {
        let mut decl = MethodDecl::new(method).annotated(Annotation::Constraint {
            path: path.to_string(),
            operator,
        });
        if operator.takes_collection() {
            decl = decl.param(ParamShape::Collection("Value".into()));
        } else if operator.arity() == 1 {
            decl = decl.param(ParamShape::Value("Value".into()));
        }
        self.method(decl)
    }

    pub fn order(self, method: &str, path: &str, asc: bool) -> Self {
        self.method(MethodDecl::new(method).annotated(Annotation::Order {
            path: path.to_string(),
            asc,
        }))
    }

    pub fn select(self, method: &str, path: &str, returns: ReturnShape) -> Self {
        self.method(
            MethodDecl::new(method)
                .annotated(Annotation::Select {
                    path: path.to_string(),
                })
                .param(ParamShape::Session)
                .returns(returns),
        )
    }

    /// Validates every method and collects every problem before failing.
    pub fn compile(&self) -> DataResult<QueryDescriptor> {
        let mut problems = Vec::new();
        let mut handlers = BTreeMap::new();
        let mut methods: Vec<&MethodDecl> = self.methods.iter().collect();
        methods.sort_by(|a, b| a.name.cmp(&b.name));
        for method in methods {
            if let Some(handler) = self.compile_method(method, &mut problems) {
                handlers.insert(method.name.clone(), handler);
            }
        }
        if !problems.is_empty() {
            return Err(DataError::InvalidQueryDeclaration {
                query: self.name.clone(),
                problems,
            });
        }
        Ok(QueryDescriptor {
            query: self.name.clone(),
            handlers,
        })
    }

    fn compile_method(&self, method: &MethodDecl, problems: &mut Vec<String>) -> Option<MethodHandler> {
        let name = &method.name;
        let annotation = match method.annotations.as_slice() {
            [] => {
                problems.push(format!("{name}() must be annotated @Constraint, @Order or @Select"));
                return None;
            }
            [annotation] => annotation,
            _ => {
                problems.push(format!("{name}() has too many annotations"));
                return None;
            }
        };

        match annotation {
            Annotation::Constraint { path, operator } => {
                if !is_valid_path(path) {
                    problems.push(format!("{name}() path is not valid: '{path}'"));
                    return None;
                }
                if method.returns != ReturnShape::This {
                    problems.push(format!(
                        "{name}() returns {} but @Constraint methods must return this ({})",
                        method.returns.type_name(&self.name),
                        self.name
                    ));
                    return None;
                }
                if method.params.len() != operator.arity() {
                    problems.push(format!(
                        "{name}() declares {} parameters but must accept {} parameters",
                        method.params.len(),
                        operator.arity()
                    ));
                    return None;
                }
                if operator.takes_collection()
                    && !matches!(
                        method.params.first(),
                        Some(ParamShape::Collection(_) | ParamShape::Varargs(_))
                    )
                {
                    problems.push(format!("{name}() parameter must be a vararg or a collection"));
                    return None;
                }
                Some(MethodHandler::Constraint {
                    path: path.clone(),
                    operator: *operator,
                })
            }
            Annotation::Order { path, asc } => {
                if !is_valid_path(path) {
                    problems.push(format!("{name}() path is not valid: '{path}'"));
                    return None;
                }
                if method.returns != ReturnShape::This {
                    problems.push(format!(
                        "{name}() returns {} but @Order methods must return this ({})",
                        method.returns.type_name(&self.name),
                        self.name
                    ));
                    return None;
                }
                Some(MethodHandler::Order {
                    path: path.clone(),
                    asc: *asc,
                })
            }
            Annotation::Select { path } => compile_select(name, path, method, problems),
        }
    }
}

fn compile_select(
    name: &str,
    path: &str,
    method: &MethodDecl,
    problems: &mut Vec<String>,
) -> Option<MethodHandler> {
    if method.params.as_slice() != [ParamShape::Session] {
        problems.push(format!("{name}() must accept a single Session parameter"));
        return None;
    }
    let (returns_list, element) = match &method.returns {
        ReturnShape::List {
            element,
            nullable: false,
        } => (true, element),
        ReturnShape::Single {
            element,
            nullable: true,
        } => (false, element),
        _ => {
            problems.push(format!(
                "{name}() return type must be a non-null List or a nullable value"
            ));
            return None;
        }
    };

    let projection = match element {
        ResultKind::Projection(decl) => Some(decl),
        ResultKind::Value(_) => None,
    };
    if !is_valid_path(path) && (!path.is_empty() || projection.is_none()) {
        problems.push(format!("{name}() path is not valid: '{path}'"));
        return None;
    }

    let Some(decl) = projection else {
        return Some(MethodHandler::Select {
            returns_list,
            projection: None,
            paths: vec![path.to_string()],
        });
    };
    if !decl.primary_constructor {
        problems.push(format!("{} has no primary constructor", decl.name));
        return None;
    }
    let prefix = if path.is_empty() {
        String::new()
    } else {
        format!("{path}.")
    };
    let mut paths = Vec::new();
    let before = problems.len();
    for (index, property) in decl.properties.iter().enumerate() {
        match property {
            None => problems.push(format!(
                "{} parameter {index} is missing a @Property annotation",
                decl.name
            )),
            Some(property) if !is_valid_path(property) => problems.push(format!(
                "{} parameter {index} path is not valid: '{property}'",
                decl.name
            )),
            Some(property) => paths.push(format!("{prefix}{property}")),
        }
    }
    if problems.len() > before {
        return None;
    }
    Some(MethodHandler::Select {
        returns_list,
        projection: Some(decl.name.clone()),
        paths,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodHandler {
    Constraint { path: String, operator: Operator },
    Order { path: String, asc: bool },
    Select {
        returns_list: bool,
        projection: Option<String>,
        paths: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryDescriptor {
    pub query: String,
    pub handlers: BTreeMap<String, MethodHandler>,
}

impl QueryDescriptor {
    /// Descriptor without declared methods, used by dynamic queries.
    pub fn empty(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            handlers: BTreeMap::new(),
        }
    }

    pub fn handler(&self, method: &str) -> Option<&MethodHandler> {
        self.handlers.get(method)
    }
}
