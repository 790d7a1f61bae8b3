use log::{Level, log};

use crate::{
    bytecode::Instruction,
    diagnostics::Diagnostic,
    engine::EngineBuilder,
    registry::{CallTarget, NativeContext},
    template::{ObjectTemplate, TemplateBuilder},
    value::Primitive,
};

/// Log target for messages emitted by scripts.
pub const SCRIPT_TARGET: &str = "noodle::script";

type NativeResult = Result<Primitive, Diagnostic>;

pub fn install(builder: EngineBuilder) -> EngineBuilder {
    builder
        .register_builtin("argumentCount", 0, args_count)
        .register_builtin("getArgument", 1, args_get)
        .register_builtin("castToInt", 1, cast_to_int)
        .register_builtin("toString", 1, cast_to_string)
        .register_builtin("logInfo", 1, |ctx, args| script_log(ctx, Level::Info, &args[0]))
        .register_builtin("logWarning", 1, |ctx, args| script_log(ctx, Level::Warn, &args[0]))
        .register_builtin("logError", 1, |ctx, args| script_log(ctx, Level::Error, &args[0]))
        .register_template(array_template())
        .register_system_macro(
            "argumentCount",
            vec![Instruction::Call {
                target: CallTarget::Builtin,
                name: "argumentCount".to_string(),
                arity: 0,
            }],
        )
}

fn args_count(ctx: &mut NativeContext<'_>, _args: &[Primitive]) -> NativeResult {
    Ok(Primitive::Number(ctx.arguments().len() as f64))
}

fn args_get(ctx: &mut NativeContext<'_>, args: &[Primitive]) -> NativeResult {
    let index = args[0].expect_number("getArgument")?;
    let count = ctx.arguments().len();
    if index.fract() != 0.0 || index < 0.0 || index >= count as f64 {
        return Err(Diagnostic::runtime(format!(
            "argument index {index} is out of range for {count} arguments"
        )));
    }
    Ok(ctx.arguments()[index as usize].clone())
}

fn cast_to_int(_ctx: &mut NativeContext<'_>, args: &[Primitive]) -> NativeResult {
    let value = match &args[0] {
        Primitive::Number(value) => *value,
        Primitive::Boolean(flag) => f64::from(u8::from(*flag)),
        Primitive::String(text) => text.trim().parse::<f64>().map_err(|_| {
            Diagnostic::runtime(format!("castToInt cannot parse \"{text}\" as a number"))
        })?,
        other => {
            return Err(Diagnostic::runtime(format!(
                "castToInt expects a Number, Boolean or String, found {}",
                other.type_name()
            )));
        }
    };
    if !value.is_finite() {
        return Err(Diagnostic::runtime(format!("castToInt cannot truncate {value}")));
    }
    Ok(Primitive::Number(value.trunc()))
}

fn cast_to_string(ctx: &mut NativeContext<'_>, args: &[Primitive]) -> NativeResult {
    Ok(Primitive::string(ctx.render(&args[0])?))
}

fn script_log(ctx: &mut NativeContext<'_>, level: Level, value: &Primitive) -> NativeResult {
    let message = ctx.render(value)?;
    log!(target: SCRIPT_TARGET, level, "{message}");
    Ok(Primitive::Null)
}

/// Fixed-length list of values, created with `new Array(length)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Array(pub Vec<Primitive>);

impl Array {
    fn slot(&mut self, index: &Primitive, method: &str) -> Result<&mut Primitive, Diagnostic> {
        let length = self.0.len();
        let index = index.expect_number(method)?;
        if index.fract() != 0.0 || index < 0.0 || index >= length as f64 {
            return Err(Diagnostic::runtime(format!(
                "array index {index} is out of range for length {length}"
            )));
        }
        Ok(&mut self.0[index as usize])
    }
}

fn array_template() -> ObjectTemplate {
    TemplateBuilder::<Array>::new("Array")
        .constructor(1, |args| {
            let length = args[0].expect_number("Array")?;
            if length.fract() != 0.0 || length < 0.0 {
                return Err(Diagnostic::runtime(format!(
                    "array length must be a non-negative integer, found {length}"
                )));
            }
            Ok(Array(vec![Primitive::Null; length as usize]))
        })
        .method("get", 1, |array, args| Ok(array.slot(&args[0], "get")?.clone()))
        .method("set", 2, |array, args| {
            let slot = array.slot(&args[0], "set")?;
            Ok(std::mem::replace(slot, args[1].clone()))
        })
        .getter("length", |array| Ok(Primitive::Number(array.0.len() as f64)))
        .trace(|array, out| out.extend(array.0.iter().filter_map(Primitive::as_object)))
        .display(|array| {
            let items = array.0.iter().map(Primitive::to_string).collect::<Vec<_>>();
            format!("[{}]", items.join(", "))
        })
        .equality(|lhs, rhs| lhs == rhs)
        .build()
}
