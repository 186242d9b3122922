use anyhow::Result;
use greener_query::ast::Query;
use greener_query::config::CompilerConfig;
use greener_query::dialect::DialectKind;
use greener_query::sql_compiler::{describe_values, SqlCompiler};
use greener_query::{parse, validate, QueryError, QueryPlan, QueryType};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

const CONFIG_FILE: &str = "query_config.json";
const PROMPT: &str = "greener> ";

/// 加载编译器配置，失败时使用默认配置
fn load_config() -> CompilerConfig {
    match CompilerConfig::from_json_file(CONFIG_FILE) {
        Ok(config) => {
            info!(file = CONFIG_FILE, dialect = %config.dialect, "loaded compiler config");
            config
        }
        Err(e) => {
            warn!(error = %e, "using default compiler config");
            CompilerConfig::default()
        }
    }
}

/// 控制台会话状态
struct Console {
    config: CompilerConfig,
    compiler: SqlCompiler,
    query_type: QueryType,
    owner: Uuid,
    show_ast: bool,
}

impl Console {
    fn new(config: CompilerConfig) -> Self {
        Self {
            compiler: SqlCompiler::from_config(&config),
            config,
            query_type: QueryType::TestcaseList,
            owner: Uuid::nil(),
            show_ast: false,
        }
    }

    /// 处理 `:` 开头的命令，返回 false 表示退出
    fn command(&mut self, line: &str) -> bool {
        let mut words = line.split_whitespace();
        let name = words.next().unwrap_or("");
        let arg = words.next();
        match (name, arg) {
            (":quit" | ":q", _) => return false,
            (":type", Some(value)) => match value.parse::<QueryType>() {
                Ok(query_type) => {
                    self.query_type = query_type;
                    println!("查询类型: {}", query_type);
                }
                Err(e) => println!("✗ {}", e),
            },
            (":dialect", Some(value)) => match value.parse::<DialectKind>() {
                Ok(kind) => {
                    self.config.dialect = kind;
                    self.compiler = SqlCompiler::from_config(&self.config);
                    println!("SQL 方言: {}", kind);
                }
                Err(e) => println!("✗ {}", e),
            },
            (":owner", Some(value)) => match Uuid::parse_str(value) {
                Ok(owner) => {
                    self.owner = owner;
                    println!("用户: {}", owner);
                }
                Err(e) => println!("✗ 无效的 UUID: {}", e),
            },
            (":ast", _) => {
                self.show_ast = !self.show_ast;
                println!("打印 AST: {}", if self.show_ast { "开" } else { "关" });
            }
            (":all", _) => {
                if let Err(e) = self.plan(&Query::default()).map(|plan| print_plan(&plan)) {
                    print_error(&e);
                }
            }
            (":testcase" | ":session", Some(value)) => match Uuid::parse_str(value) {
                Ok(id) => {
                    let plan = if name == ":testcase" {
                        self.compiler.compile_testcase_detail(self.owner, id)
                    } else {
                        self.compiler.compile_session_detail(self.owner, id)
                    };
                    print_plan(&plan);
                }
                Err(e) => println!("✗ 无效的 UUID: {}", e),
            },
            _ => print_help(),
        }
        true
    }

    /// 解析、校验并编译一条查询，打印生成的 SQL
    fn run(&self, input: &str) -> Result<(), QueryError> {
        let query = parse(input)?;
        if self.show_ast {
            match serde_json::to_string_pretty(&query) {
                Ok(json) => println!("[AST]:\n{}", json),
                Err(e) => println!("✗ 无法序列化 AST: {}", e),
            }
        }
        validate(&query, self.query_type)?;
        print_plan(&self.plan(&query)?);
        Ok(())
    }

    /// 按当前查询类型和用户编译查询
    fn plan(&self, query: &Query) -> Result<QueryPlan, QueryError> {
        self.compiler.compile(self.owner, query, self.query_type)
    }
}

fn print_plan(plan: &QueryPlan) {
    let (sql, values) = plan.to_sql();
    println!("[SQL]:\n{}", sql);
    println!("[参数]:");
    for (i, value) in describe_values(&values).iter().enumerate() {
        println!("  {:>2}: {}", i + 1, value);
    }
}

fn print_help() {
    println!("命令:");
    println!("  :type testcases|sessions|groups   切换查询类型");
    println!("  :dialect postgres|mysql|sqlite    切换 SQL 方言");
    println!("  :owner <uuid>                     设置查询所属用户");
    println!("  :all                              编译空查询（匹配全部记录）");
    println!("  :testcase <uuid> | :session <uuid> 编译单条记录查询");
    println!("  :ast                              切换是否打印 AST");
    println!("  :quit                             退出");
}

fn print_error(e: &QueryError) {
    println!("✗ {}", e);
    if let QueryError::Syntax {
        span: Some(span), ..
    } = e
    {
        println!("  位置 {}-{}", span.start, span.end);
    }
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    println!("--- Greener 查询语言到 SQL 编译器 ---");
    let mut console = Console::new(load_config());
    print_help();

    let mut editor = DefaultEditor::new()?;
    loop {
        match editor.readline(PROMPT) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(line);
                if line.starts_with(':') {
                    if !console.command(line) {
                        break;
                    }
                    continue;
                }
                if let Err(e) = console.run(line) {
                    print_error(&e);
                }
            }
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
