//! Statement parser for the supported SQL dialect.
//!
//! Grammar (exhaustive):
//!
//! - `CREATE TABLE t (c TYPE [IS NOT NULL], ...) [IF NOT EXISTS]`
//! - `DROP TABLE t [IF EXISTS]`
//! - `INSERT INTO t FROM '<path>' [ROWS PER SHARD n]`
//! - `SELECT <list> FROM t [WHERE atom [AND atom]...] [GROUP BY c, ...]`
//!
//! The parser performs no name resolution; it does enforce the static
//! shape rules: bare columns or aggregates only in the SELECT list, a
//! conjunction of simple atoms in WHERE, bare columns in GROUP BY, and
//! every non-aggregate projection grouped when aggregates are present.

use std::fmt;

use crate::sharding::DataType;

pub mod error;
pub mod lexer;

pub use error::ParseError;
use lexer::{tokenize, Token, TokenKind};

/// A parsed statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    CreateTable(CreateTable),
    DropTable(DropTable),
    InsertFrom(InsertFrom),
    Select(Select),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateTable {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub if_not_exists: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: DataType,
    pub not_null: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DropTable {
    pub name: String,
    pub if_exists: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertFrom {
    pub table: String,
    pub path: String,
    pub rows_per_shard: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub projection: Vec<SelectItem>,
    pub table: String,
    pub filter: Vec<Predicate>,
    pub group_by: Vec<String>,
}

impl Select {
    pub fn has_aggregates(&self) -> bool {
        self.projection
            .iter()
            .any(|item| matches!(item, SelectItem::Aggregate { .. }))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectItem {
    Star,
    Column {
        name: String,
        alias: Option<String>,
    },
    Aggregate {
        function: AggregateFunction,
        argument: AggregateArg,
        alias: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum AggregateArg {
    Star,
    Column(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunction {
    Count,
    Sum,
    Min,
    Max,
    Avg,
}

impl AggregateFunction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateFunction::Count => "count",
            AggregateFunction::Sum => "sum",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
            AggregateFunction::Avg => "avg",
        }
    }

    fn from_word(word: &str) -> Option<Self> {
        match word.to_ascii_lowercase().as_str() {
            "count" => Some(AggregateFunction::Count),
            "sum" => Some(AggregateFunction::Sum),
            "min" => Some(AggregateFunction::Min),
            "max" => Some(AggregateFunction::Max),
            "avg" => Some(AggregateFunction::Avg),
            _ => None,
        }
    }
}

/// One WHERE atom. Atoms are chained with AND only.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub column: String,
    pub test: PredicateTest,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PredicateTest {
    Compare(CmpOp, Literal),
    IsNull,
    IsNotNull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl CmpOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::NotEq => "!=",
            CmpOp::Lt => "<",
            CmpOp::LtEq => "<=",
            CmpOp::Gt => ">",
            CmpOp::GtEq => ">=",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Bigint(i64),
    Double(f64),
    Boolean(bool),
    String(String),
    Null,
}

/// Parse a single statement.
pub fn parse(sql: &str) -> Result<Statement, ParseError> {
    let tokens = tokenize(sql)?;
    let mut parser = Parser { tokens, pos: 0 };

    let statement = if parser.peek().is_keyword("SELECT") {
        Statement::Select(parser.select()?)
    } else if parser.peek().is_keyword("CREATE") {
        Statement::CreateTable(parser.create_table()?)
    } else if parser.peek().is_keyword("DROP") {
        Statement::DropTable(parser.drop_table()?)
    } else if parser.peek().is_keyword("INSERT") {
        Statement::InsertFrom(parser.insert_from()?)
    } else {
        return Err(parser.error(vec!["SELECT", "CREATE", "DROP", "INSERT"]));
    };

    parser.expect_eof()?;
    Ok(statement)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn error(&self, expected: Vec<&'static str>) -> ParseError {
        let token = self.peek();
        ParseError::new(token.offset, expected, token.text.clone())
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.peek().is_keyword(keyword) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, keyword: &'static str) -> Result<(), ParseError> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(self.error(vec![keyword]))
        }
    }

    fn expect_kind(&mut self, kind: TokenKind, expected: &'static str) -> Result<Token, ParseError> {
        if self.peek().kind == kind {
            Ok(self.advance())
        } else {
            Err(self.error(vec![expected]))
        }
    }

    fn identifier(&mut self, expected: &'static str) -> Result<String, ParseError> {
        Ok(self.expect_kind(TokenKind::Word, expected)?.text)
    }

    fn expect_eof(&mut self) -> Result<(), ParseError> {
        if self.peek().kind == TokenKind::Eof {
            Ok(())
        } else {
            Err(self.error(vec!["end of statement"]))
        }
    }

    fn create_table(&mut self) -> Result<CreateTable, ParseError> {
        self.expect_keyword("CREATE")?;
        self.expect_keyword("TABLE")?;
        let name = self.identifier("table name")?;

        self.expect_kind(TokenKind::LeftParen, "(")?;
        let mut columns = vec![];
        loop {
            columns.push(self.column_def()?);
            if self.peek().kind == TokenKind::Comma {
                self.advance();
            } else {
                break;
            }
        }
        self.expect_kind(TokenKind::RightParen, ")")?;

        let if_not_exists = if self.eat_keyword("IF") {
            self.expect_keyword("NOT")?;
            self.expect_keyword("EXISTS")?;
            true
        } else {
            false
        };

        Ok(CreateTable {
            name,
            columns,
            if_not_exists,
        })
    }

    fn column_def(&mut self) -> Result<ColumnDef, ParseError> {
        let name = self.identifier("column name")?;
        let type_token = self.expect_kind(TokenKind::Word, "type name")?;
        let data_type: DataType = type_token
            .text
            .parse()
            .map_err(|_| ParseError::new(type_token.offset, vec!["type name"], type_token.text))?;

        let not_null = if self.eat_keyword("IS") {
            self.expect_keyword("NOT")?;
            self.expect_keyword("NULL")?;
            true
        } else {
            false
        };

        Ok(ColumnDef {
            name,
            data_type,
            not_null,
        })
    }

    fn drop_table(&mut self) -> Result<DropTable, ParseError> {
        self.expect_keyword("DROP")?;
        self.expect_keyword("TABLE")?;
        let name = self.identifier("table name")?;

        let if_exists = if self.eat_keyword("IF") {
            self.expect_keyword("EXISTS")?;
            true
        } else {
            false
        };

        Ok(DropTable { name, if_exists })
    }

    fn insert_from(&mut self) -> Result<InsertFrom, ParseError> {
        self.expect_keyword("INSERT")?;
        self.expect_keyword("INTO")?;
        let table = self.identifier("table name")?;
        self.expect_keyword("FROM")?;
        let path = self.expect_kind(TokenKind::String, "quoted path")?.text;

        let rows_per_shard = if self.eat_keyword("ROWS") {
            self.expect_keyword("PER")?;
            self.expect_keyword("SHARD")?;
            let token = self.expect_kind(TokenKind::Number, "shard size")?;
            let count: usize = token
                .text
                .parse()
                .map_err(|_| ParseError::new(token.offset, vec!["positive integer"], token.text.clone()))?;
            if count == 0 {
                return Err(ParseError::new(
                    token.offset,
                    vec!["positive integer"],
                    token.text,
                ));
            }
            Some(count)
        } else {
            None
        };

        Ok(InsertFrom {
            table,
            path,
            rows_per_shard,
        })
    }

    fn select(&mut self) -> Result<Select, ParseError> {
        self.expect_keyword("SELECT")?;

        let mut projection = vec![];
        let mut offsets = vec![];
        loop {
            offsets.push(self.peek().offset);
            projection.push(self.select_item()?);
            if self.peek().kind == TokenKind::Comma {
                self.advance();
            } else {
                break;
            }
        }

        self.expect_keyword("FROM")?;
        let table = self.identifier("table name")?;

        let mut filter = vec![];
        if self.eat_keyword("WHERE") {
            loop {
                filter.push(self.predicate()?);
                if !self.eat_keyword("AND") {
                    break;
                }
            }
        }

        let mut group_by = vec![];
        if self.eat_keyword("GROUP") {
            self.expect_keyword("BY")?;
            loop {
                group_by.push(self.identifier("column name")?);
                if self.peek().kind == TokenKind::Comma {
                    self.advance();
                } else {
                    break;
                }
            }
        }

        let select = Select {
            projection,
            table,
            filter,
            group_by,
        };
        self.validate_select(&select, &offsets)?;

        Ok(select)
    }

    fn select_item(&mut self) -> Result<SelectItem, ParseError> {
        if self.peek().kind == TokenKind::Star {
            self.advance();
            return Ok(SelectItem::Star);
        }

        let word = self.expect_kind(TokenKind::Word, "column or aggregate")?;

        if self.peek().kind == TokenKind::LeftParen {
            let function = AggregateFunction::from_word(&word.text).ok_or_else(|| {
                ParseError::new(
                    word.offset,
                    vec!["COUNT", "SUM", "MIN", "MAX", "AVG"],
                    word.text.clone(),
                )
            })?;
            self.advance();

            let argument = if self.peek().kind == TokenKind::Star {
                self.advance();
                AggregateArg::Star
            } else {
                AggregateArg::Column(self.identifier("column name")?)
            };
            self.expect_kind(TokenKind::RightParen, ")")?;

            if !matches!(function, AggregateFunction::Count) && argument == AggregateArg::Star {
                return Err(ParseError::new(
                    word.offset,
                    vec!["aggregate over a column"],
                    format!("{}(*)", function.as_str()),
                ));
            }

            let alias = self.alias()?;
            return Ok(SelectItem::Aggregate {
                function,
                argument,
                alias,
            });
        }

        let alias = self.alias()?;
        Ok(SelectItem::Column {
            name: word.text,
            alias,
        })
    }

    fn alias(&mut self) -> Result<Option<String>, ParseError> {
        if self.eat_keyword("AS") {
            Ok(Some(self.identifier("alias")?))
        } else {
            Ok(None)
        }
    }

    fn predicate(&mut self) -> Result<Predicate, ParseError> {
        let column = self.identifier("column name")?;

        if self.eat_keyword("IS") {
            let test = if self.eat_keyword("NOT") {
                self.expect_keyword("NULL")?;
                PredicateTest::IsNotNull
            } else {
                self.expect_keyword("NULL")?;
                PredicateTest::IsNull
            };
            return Ok(Predicate { column, test });
        }

        let op = match self.peek().kind {
            TokenKind::Eq => CmpOp::Eq,
            TokenKind::NotEq => CmpOp::NotEq,
            TokenKind::Lt => CmpOp::Lt,
            TokenKind::LtEq => CmpOp::LtEq,
            TokenKind::Gt => CmpOp::Gt,
            TokenKind::GtEq => CmpOp::GtEq,
            _ => return Err(self.error(vec!["=", "!=", "<", "<=", ">", ">=", "IS"])),
        };
        self.advance();

        let literal = self.literal()?;
        Ok(Predicate {
            column,
            test: PredicateTest::Compare(op, literal),
        })
    }

    fn literal(&mut self) -> Result<Literal, ParseError> {
        let token = self.peek().clone();

        match token.kind {
            TokenKind::Number => {
                self.advance();
                if token.text.contains('.') {
                    token
                        .text
                        .parse()
                        .map(Literal::Double)
                        .map_err(|_| ParseError::new(token.offset, vec!["number"], token.text))
                } else {
                    token
                        .text
                        .parse()
                        .map(Literal::Bigint)
                        .map_err(|_| ParseError::new(token.offset, vec!["number"], token.text))
                }
            }
            TokenKind::String => {
                self.advance();
                Ok(Literal::String(token.text))
            }
            TokenKind::Word => {
                if token.is_keyword("TRUE") {
                    self.advance();
                    Ok(Literal::Boolean(true))
                } else if token.is_keyword("FALSE") {
                    self.advance();
                    Ok(Literal::Boolean(false))
                } else if token.is_keyword("NULL") {
                    self.advance();
                    Ok(Literal::Null)
                } else {
                    Err(self.error(vec!["literal"]))
                }
            }
            _ => Err(self.error(vec!["literal"])),
        }
    }

    /// Static shape rules that don't need the table schema.
    fn validate_select(&self, select: &Select, offsets: &[usize]) -> Result<(), ParseError> {
        if select.projection.len() > 1
            && select
                .projection
                .iter()
                .any(|item| matches!(item, SelectItem::Star))
        {
            let (idx, _) = select
                .projection
                .iter()
                .enumerate()
                .find(|(_, item)| matches!(item, SelectItem::Star))
                .unwrap();
            return Err(ParseError::new(
                offsets[idx],
                vec!["* as the only projection"],
                "*",
            ));
        }

        if !select.has_aggregates() && select.group_by.is_empty() {
            return Ok(());
        }

        for (item, offset) in select.projection.iter().zip(offsets.iter()) {
            match item {
                SelectItem::Star => {
                    return Err(ParseError::new(
                        *offset,
                        vec!["aggregate or grouped column"],
                        "*",
                    ));
                }
                SelectItem::Column { name, .. } => {
                    if !select.group_by.contains(name) {
                        return Err(ParseError::new(
                            *offset,
                            vec!["column listed in GROUP BY"],
                            name.clone(),
                        ));
                    }
                }
                SelectItem::Aggregate { .. } => {}
            }
        }

        Ok(())
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Bigint(v) => write!(f, "{}", v),
            Literal::Double(v) => write!(f, "{:?}", v),
            Literal::Boolean(v) => write!(f, "{}", if *v { "TRUE" } else { "FALSE" }),
            Literal::String(v) => write!(f, "'{}'", v.replace('\'', "''")),
            Literal::Null => write!(f, "NULL"),
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.test {
            PredicateTest::Compare(op, literal) => {
                write!(f, "{} {} {}", self.column, op.as_str(), literal)
            }
            PredicateTest::IsNull => write!(f, "{} IS NULL", self.column),
            PredicateTest::IsNotNull => write!(f, "{} IS NOT NULL", self.column),
        }
    }
}

impl fmt::Display for SelectItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectItem::Star => write!(f, "*"),
            SelectItem::Column { name, alias } => match alias {
                Some(alias) => write!(f, "{} AS {}", name, alias),
                None => write!(f, "{}", name),
            },
            SelectItem::Aggregate {
                function,
                argument,
                alias,
            } => {
                let arg = match argument {
                    AggregateArg::Star => "*",
                    AggregateArg::Column(name) => name.as_str(),
                };
                match alias {
                    Some(alias) => write!(f, "{}({}) AS {}", function.as_str(), arg, alias),
                    None => write!(f, "{}({})", function.as_str(), arg),
                }
            }
        }
    }
}

impl fmt::Display for Select {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SELECT ")?;
        for (i, item) in self.projection.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", item)?;
        }
        write!(f, " FROM {}", self.table)?;

        if !self.filter.is_empty() {
            write!(f, " WHERE ")?;
            for (i, predicate) in self.filter.iter().enumerate() {
                if i > 0 {
                    write!(f, " AND ")?;
                }
                write!(f, "{}", predicate)?;
            }
        }

        if !self.group_by.is_empty() {
            write!(f, " GROUP BY {}", self.group_by.join(", "))?;
        }

        Ok(())
    }
}
