use crate::{
    backend::{
        targets::TargetFeature,
        templates::{Guard, Restriction, Template, TemplateRegistry},
    },
    intern::InternedSymbol,
    middle::{
        ctype::{CType, FIXNUM_MAX, ValuesType},
        policy::SafetyClass,
    },
};

/// Type predicates the back end can test directly, with the cost of the test
const PREDICATES: &[(&str, fn() -> CType, u32)] = &[
    ("fixnump", CType::fixnum, 1),
    ("integerp", CType::integer, 3),
    ("floatp", CType::float, 2),
    ("numberp", CType::number, 4),
    ("characterp", CType::character, 1),
    ("null", CType::null, 1),
    ("symbolp", CType::symbol, 2),
    ("stringp", CType::string, 2),
    ("functionp", CType::function, 2),
    ("consp", any_cons, 1),
    ("listp", CType::list, 2),
    ("simple-vector-p", any_vector, 2),
];

/// Types the back end checks as part of ordinary code generation
const CHECKS: &[(&str, fn() -> CType, u32)] = &[
    ("check-fixnum", CType::fixnum, 1),
    ("check-integer", CType::integer, 3),
    ("check-float", CType::float, 2),
    ("check-character", CType::character, 1),
    ("check-symbol", CType::symbol, 2),
    ("check-string", CType::string, 2),
    ("check-function", CType::function, 2),
    ("check-cons", any_cons, 1),
    ("check-list", CType::list, 2),
];

fn any_cons() -> CType {
    CType::cons(CType::Any, CType::Any)
}

fn any_vector() -> CType {
    CType::vector(CType::Any)
}

fn ty(ty: CType) -> Restriction {
    Restriction::Type(ty)
}

struct TemplateDef {
    name: &'static str,
    function: &'static str,
    args: Vec<Restriction>,
    result: Restriction,
    cost: u32,
    policy: SafetyClass,
}

impl TemplateDef {
    fn new(name: &'static str, function: &'static str, cost: u32, policy: SafetyClass) -> Self {
        Self {
            name,
            function,
            args: Vec::new(),
            result: Restriction::Any,
            cost,
            policy,
        }
    }

    fn args(mut self, args: impl IntoIterator<Item = Restriction>) -> Self {
        self.args = args.into_iter().collect();
        self
    }

    fn result(mut self, result: CType) -> Self {
        self.result = Restriction::Type(result);
        self
    }

    fn into_template(self) -> Template {
        Template {
            name: self.name,
            function: InternedSymbol::new(self.function),
            args: self.args,
            more_args: None,
            result: self.result,
            cost: self.cost,
            policy: self.policy,
            guard: None,
            conditional: false,
        }
    }
}

pub fn template_registry() -> TemplateRegistry {
    use SafetyClass::*;

    let mut registry = TemplateRegistry::new();

    for &(name, ty, cost) in PREDICATES {
        registry.add_predicate(ty(), name, cost);
    }

    for &(name, ty, cost) in CHECKS {
        registry.add_check_template(ty(), name, cost);
    }

    registry.add_known("+", derive_add);
    registry.add_known("-", derive_subtract);
    registry.add_known("*", derive_multiply);
    registry.add_known("<", derive_boolean);
    registry.add_known(">", derive_boolean);
    registry.add_known("=", derive_boolean);
    registry.add_known("eq", derive_boolean);
    registry.add_known("car", derive_car);
    registry.add_known("cdr", derive_cdr);
    registry.add_known("logcount", derive_logcount);
    registry.add_known("values", derive_values);
    registry.add_known("%typep", derive_boolean);
    registry.add_known("%type-check-error", derive_nothing);
    registry.add_known("%arg-count-error", derive_nothing);
    registry.add_known("%find-keyword", derive_any);

    let fixnum2 = || [ty(CType::fixnum()), ty(CType::fixnum())];
    let float2 = || [ty(CType::float()), ty(CType::float())];
    let integer2 = || [ty(CType::integer()), ty(CType::integer())];

    let arithmetic = [
        ("+", "fast-fixnum+", "fixnum+-overflow", "unsafe-fixnum+", "float+"),
        ("-", "fast-fixnum-", "fixnum--overflow", "unsafe-fixnum-", "float-"),
    ];

    for (function, fast, overflow, unchecked, float) in arithmetic {
        let defs = [
            TemplateDef::new(fast, function, 1, FastSafe)
                .args(fixnum2())
                .result(CType::fixnum()),
            TemplateDef::new(overflow, function, 4, FastSafe)
                .args(fixnum2())
                .result(CType::integer()),
            TemplateDef::new(unchecked, function, 1, Fast).args(fixnum2()),
            TemplateDef::new(float, function, 2, FastSafe)
                .args(float2())
                .result(CType::float()),
        ];

        for def in defs {
            registry.add_template(def.into_template());
        }
    }

    let multiply = [
        TemplateDef::new("fast-fixnum*", "*", 3, FastSafe)
            .args(fixnum2())
            .result(CType::fixnum()),
        TemplateDef::new("fixnum*-overflow", "*", 8, FastSafe)
            .args(fixnum2())
            .result(CType::integer()),
        TemplateDef::new("unsafe-fixnum*", "*", 3, Fast).args(fixnum2()),
        TemplateDef::new("float*", "*", 4, FastSafe)
            .args(float2())
            .result(CType::float()),
    ];

    for def in multiply {
        registry.add_template(def.into_template());
    }

    for (function, prefix) in [("<", "<"), (">", ">"), ("=", "=")] {
        let comparisons = [
            (format!("fast-if-{prefix}"), fixnum2(), 1),
            (format!("float-if-{prefix}"), float2(), 2),
            (format!("integer-if-{prefix}"), integer2(), 5),
        ];

        for (name, args, cost) in comparisons {
            registry.add_template(Template {
                conditional: true,
                ..TemplateDef::new(leak(name), function, cost, FastSafe)
                    .args(args)
                    .into_template()
            });
        }
    }

    registry.add_template(Template {
        conditional: true,
        ..TemplateDef::new("if-eq", "eq", 1, Safe)
            .args([Restriction::Any, Restriction::Any])
            .into_template()
    });

    for function in ["car", "cdr"] {
        let defs = [
            TemplateDef::new(leak(format!("{function}/list")), function, 1, FastSafe)
                .args([ty(CType::list())]),
            TemplateDef::new(leak(format!("unsafe-{function}")), function, 1, Small)
                .args([Restriction::Any]),
            TemplateDef::new(leak(format!("checked-{function}")), function, 3, Safe)
                .args([Restriction::Any]),
        ];

        for def in defs {
            registry.add_template(def.into_template());
        }
    }

    let unsigned_fixnum = CType::int_range(Some(0), Some(FIXNUM_MAX));
    registry.add_template(Template {
        guard: Some(Guard::Feature(TargetFeature::Popcnt)),
        ..TemplateDef::new("popcnt", "logcount", 1, FastSafe)
            .args([ty(unsigned_fixnum)])
            .into_template()
    });
    registry.add_template(
        TemplateDef::new("logcount/fixnum", "logcount", 8, FastSafe)
            .args([ty(CType::fixnum())])
            .into_template(),
    );

    for &(name, ty, cost) in PREDICATES {
        registry.add_template(Template {
            guard: Some(Guard::TypeArgument { index: 1, ty: ty() }),
            conditional: true,
            ..TemplateDef::new(name, "%typep", cost, Safe)
                .args([Restriction::Any, Restriction::Any])
                .into_template()
        });
    }

    registry.add_template(
        TemplateDef::new("type-check-error", "%type-check-error", 5, Safe)
            .args([Restriction::Any, Restriction::Any, Restriction::Any])
            .into_template(),
    );
    registry.add_template(
        TemplateDef::new("arg-count-error", "%arg-count-error", 5, Safe)
            .args([Restriction::Any])
            .into_template(),
    );
    registry.add_template(Template {
        more_args: Some(Restriction::Any),
        ..TemplateDef::new("push-values", "values", 1, Safe).into_template()
    });
    registry.add_template(Template {
        more_args: Some(Restriction::Any),
        ..TemplateDef::new("find-keyword", "%find-keyword", 4, Safe)
            .args([Restriction::Any, Restriction::Any])
            .into_template()
    });

    registry
}

/// Generated template names are interned so they can be `&'static str`
fn leak(name: String) -> &'static str {
    InternedSymbol::new(&name).value()
}

fn single(ty: CType) -> ValuesType {
    ValuesType::single(ty)
}

fn derive_any(_: &[CType]) -> ValuesType {
    single(CType::Any)
}

fn derive_nothing(_: &[CType]) -> ValuesType {
    ValuesType::nothing()
}

fn derive_boolean(_: &[CType]) -> ValuesType {
    single(CType::boolean())
}

fn derive_values(args: &[CType]) -> ValuesType {
    ValuesType::fixed(args.to_vec())
}

fn derive_arithmetic(
    args: &[CType],
    bounds: impl Fn(&[(Option<i64>, Option<i64>)]) -> Option<(Option<i64>, Option<i64>)>,
) -> ValuesType {
    let integer_bounds: Option<Vec<_>> = args.iter().map(CType::integer_bounds).collect();

    if let Some(integer_bounds) = integer_bounds {
        return match bounds(&integer_bounds) {
            Some((low, high)) => single(CType::int_range(low, high)),
            None => single(CType::integer()),
        };
    }

    if !args.is_empty() && args.iter().all(|a| a.is_subtype_of(&CType::float())) {
        return single(CType::float());
    }

    single(CType::number())
}

fn derive_add(args: &[CType]) -> ValuesType {
    derive_arithmetic(args, |bounds| {
        bounds.iter().try_fold((Some(0), Some(0)), |(low, high), (l, h)| {
            Some((add_bound(low, *l)?, add_bound(high, *h)?))
        })
    })
}

fn derive_subtract(args: &[CType]) -> ValuesType {
    derive_arithmetic(args, |bounds| {
        let ((first_low, first_high), rest) = bounds.split_first()?;

        rest.iter()
            .try_fold((*first_low, *first_high), |(low, high), (l, h)| {
                Some((subtract_bound(low, *h)?, subtract_bound(high, *l)?))
            })
    })
}

fn derive_multiply(args: &[CType]) -> ValuesType {
    derive_arithmetic(args, |bounds| {
        bounds.iter().try_fold((Some(1i64), Some(1i64)), |(low, high), (l, h)| {
            let (low, high, l, h) = (low?, high?, (*l)?, (*h)?);
            let products = [
                low.checked_mul(l)?,
                low.checked_mul(h)?,
                high.checked_mul(l)?,
                high.checked_mul(h)?,
            ];

            Some((products.iter().min().copied(), products.iter().max().copied()))
        })
    })
}

/// Adds two bounds of the same side. An unbounded side stays unbounded, and
/// overflow gives up on the whole range.
fn add_bound(a: Option<i64>, b: Option<i64>) -> Option<Option<i64>> {
    match (a, b) {
        (Some(a), Some(b)) => a.checked_add(b).map(Some),
        _ => Some(None),
    }
}

fn subtract_bound(a: Option<i64>, b: Option<i64>) -> Option<Option<i64>> {
    match (a, b) {
        (Some(a), Some(b)) => a.checked_sub(b).map(Some),
        _ => Some(None),
    }
}

fn cons_part(args: &[CType], car: bool) -> ValuesType {
    let part = match args.first().map(CType::atoms) {
        Some([crate::middle::ctype::Atom::Cons { car: a, cdr: d }]) => {
            if car { (**a).clone() } else { (**d).clone() }
        }
        _ => CType::Any,
    };

    single(part)
}

fn derive_car(args: &[CType]) -> ValuesType {
    cons_part(args, true)
}

fn derive_cdr(args: &[CType]) -> ValuesType {
    cons_part(args, false)
}

fn derive_logcount(args: &[CType]) -> ValuesType {
    match args.first() {
        Some(arg) if arg.is_subtype_of(&CType::fixnum()) => {
            single(CType::int_range(Some(0), Some(62)))
        }
        _ => single(CType::int_range(Some(0), None)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(low: i64, high: i64) -> CType {
        CType::int_range(Some(low), Some(high))
    }

    #[test]
    fn addition_adds_bounds() {
        assert_eq!(
            derive_add(&[range(0, 10), range(5, 7)]),
            single(range(5, 17))
        );
        assert_eq!(
            derive_add(&[CType::fixnum(), CType::fixnum()]),
            single(range(2 * crate::middle::ctype::FIXNUM_MIN, 2 * FIXNUM_MAX))
        );
    }

    #[test]
    fn subtraction_crosses_bounds() {
        assert_eq!(
            derive_subtract(&[range(0, 10), range(1, 3)]),
            single(range(-3, 9))
        );
    }

    #[test]
    fn unbounded_or_mixed_arithmetic_widens() {
        assert_eq!(
            derive_add(&[CType::integer(), range(0, 1)]),
            single(CType::integer())
        );
        assert_eq!(derive_add(&[CType::float(), CType::float()]), single(CType::float()));
        assert_eq!(derive_add(&[CType::Any, CType::fixnum()]), single(CType::number()));
    }

    #[test]
    fn multiplication_overflow_gives_up_on_range() {
        assert_eq!(
            derive_multiply(&[range(-2, 3), range(4, 5)]),
            single(range(-10, 15))
        );
        assert_eq!(
            derive_multiply(&[CType::fixnum(), CType::fixnum()]),
            single(CType::integer())
        );
    }
}
