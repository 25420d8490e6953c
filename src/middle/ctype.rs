//! The type lattice the passes reason with. A `CType` is either the
//! universal type or a normalized union of atoms; the empty union is the
//! bottom type (no value has it).
//!
//! The passes only rely on four operations: subtype test, union,
//! intersection and difference. Difference is the only partial one: when
//! the exact result can not be represented `None` is returned and callers
//! must fall back to testing the original type.

use std::cmp::Ordering;

use itertools::Itertools;

/// Smallest and largest values of an immediate (tagged) integer on the
/// reference target
pub const FIXNUM_MIN: i64 = -(1 << 62);
pub const FIXNUM_MAX: i64 = (1 << 62) - 1;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CType {
    /// Accepts any value (`t`)
    Any,
    /// Sorted, non-overlapping atoms. Integer ranges are merged when they
    /// touch, and atoms subsumed by another atom are dropped.
    Union(Vec<Atom>),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Atom {
    /// Integers between the bounds, inclusive. `None` is unbounded.
    Integer {
        low: Option<i64>,
        high: Option<i64>,
    },
    Float,
    Character,
    /// The empty list / false value
    Null,
    /// Any symbol other than `Null`
    Symbol,
    String,
    Function,
    Cons {
        car: Box<CType>,
        cdr: Box<CType>,
    },
    /// A vector whose elements all have the element type
    Vector(Box<CType>),
}

impl Atom {
    fn integer(low: Option<i64>, high: Option<i64>) -> Option<Self> {
        match (low, high) {
            (Some(l), Some(h)) if l > h => None,
            _ => Some(Atom::Integer { low, high }),
        }
    }

    fn is_integer(&self) -> bool {
        matches!(self, Atom::Integer { .. })
    }
}

fn low_le(a: Option<i64>, b: Option<i64>) -> bool {
    // None is negative infinity
    match (a, b) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(a), Some(b)) => a <= b,
    }
}

fn high_ge(a: Option<i64>, b: Option<i64>) -> bool {
    // None is positive infinity
    match (a, b) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(a), Some(b)) => a >= b,
    }
}

fn max_low(a: Option<i64>, b: Option<i64>) -> Option<i64> {
    if low_le(a, b) { b } else { a }
}

fn min_high(a: Option<i64>, b: Option<i64>) -> Option<i64> {
    if high_ge(a, b) { b } else { a }
}

/// Whether two sorted ranges touch so they can be merged into one
fn ranges_touch(high: Option<i64>, next_low: Option<i64>) -> bool {
    match (high, next_low) {
        (None, _) | (_, None) => true,
        (Some(h), Some(l)) => l <= h.saturating_add(1),
    }
}

fn merge_integer_ranges(mut ranges: Vec<(Option<i64>, Option<i64>)>) -> Vec<Atom> {
    ranges.sort_by(|a, b| match (a.0, b.0) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => x.cmp(&y),
    });

    let mut merged: Vec<(Option<i64>, Option<i64>)> = Vec::new();

    for (low, high) in ranges {
        if let Some(last) = merged.last_mut() {
            if ranges_touch(last.1, low) {
                if !high_ge(last.1, high) {
                    last.1 = high;
                }
                continue;
            }
        }

        merged.push((low, high));
    }

    merged
        .into_iter()
        .map(|(low, high)| Atom::Integer { low, high })
        .collect()
}

impl CType {
    pub fn any() -> Self {
        CType::Any
    }

    /// The bottom type
    pub fn nothing() -> Self {
        CType::Union(Vec::new())
    }

    pub fn integer() -> Self {
        CType::int_range(None, None)
    }

    pub fn fixnum() -> Self {
        CType::int_range(Some(FIXNUM_MIN), Some(FIXNUM_MAX))
    }

    pub fn int_range(low: Option<i64>, high: Option<i64>) -> Self {
        match Atom::integer(low, high) {
            Some(atom) => CType::Union(vec![atom]),
            None => CType::nothing(),
        }
    }

    pub fn float() -> Self {
        CType::Union(vec![Atom::Float])
    }

    pub fn number() -> Self {
        CType::integer().union(&CType::float())
    }

    pub fn character() -> Self {
        CType::Union(vec![Atom::Character])
    }

    pub fn null() -> Self {
        CType::Union(vec![Atom::Null])
    }

    pub fn symbol() -> Self {
        CType::Union(vec![Atom::Symbol])
    }

    /// Result type of predicates: `null` for false, a symbol for true
    pub fn boolean() -> Self {
        CType::null().union(&CType::symbol())
    }

    pub fn string() -> Self {
        CType::Union(vec![Atom::String])
    }

    pub fn function() -> Self {
        CType::Union(vec![Atom::Function])
    }

    pub fn cons(car: CType, cdr: CType) -> Self {
        if car.is_nothing() || cdr.is_nothing() {
            return CType::nothing();
        }

        CType::Union(vec![Atom::Cons {
            car: Box::new(car),
            cdr: Box::new(cdr),
        }])
    }

    pub fn list() -> Self {
        CType::null().union(&CType::cons(CType::Any, CType::Any))
    }

    pub fn vector(element: CType) -> Self {
        CType::Union(vec![Atom::Vector(Box::new(element))])
    }

    pub fn from_atoms(atoms: impl IntoIterator<Item = Atom>) -> Self {
        Self::normalize(atoms.into_iter().collect())
    }

    pub fn is_any(&self) -> bool {
        matches!(self, CType::Any)
    }

    pub fn is_nothing(&self) -> bool {
        matches!(self, CType::Union(atoms) if atoms.is_empty())
    }

    /// True for a union of more than one atom. Type predicates on such
    /// types are never considered when weakening.
    pub fn is_union(&self) -> bool {
        matches!(self, CType::Union(atoms) if atoms.len() > 1)
    }

    pub fn atoms(&self) -> &[Atom] {
        match self {
            CType::Any => &[],
            CType::Union(atoms) => atoms,
        }
    }

    /// Overall bounds of an integer type. `None` unless every value of the
    /// type is an integer and there is at least one.
    pub fn integer_bounds(&self) -> Option<(Option<i64>, Option<i64>)> {
        let CType::Union(atoms) = self else {
            return None;
        };

        let mut bounds = None;

        for atom in atoms {
            let Atom::Integer { low, high } = atom else {
                return None;
            };

            bounds = Some(match bounds {
                None => (*low, *high),
                Some((l, h)) => (
                    if low_le(l, *low) { l } else { *low },
                    if high_ge(h, *high) { h } else { *high },
                ),
            });
        }

        bounds
    }

    fn normalize(atoms: Vec<Atom>) -> Self {
        let (integers, others): (Vec<_>, Vec<_>) = atoms.into_iter().partition(Atom::is_integer);

        let ranges = integers
            .into_iter()
            .filter_map(|atom| match atom {
                Atom::Integer { low, high } => Some((low, high)),
                _ => None,
            })
            .collect();

        let mut result = merge_integer_ranges(ranges);

        let others = others.into_iter().sorted().dedup().collect::<Vec<_>>();

        // Drop compound atoms covered by another atom of the union
        for (i, atom) in others.iter().enumerate() {
            let covered = others.iter().enumerate().any(|(j, other)| {
                i != j
                    && atom_subtype_of_atom(atom, other)
                    // Of two equivalent atoms keep the first
                    && (!atom_subtype_of_atom(other, atom) || j < i)
            });

            if !covered {
                result.push(atom.clone());
            }
        }

        result.sort();
        CType::Union(result)
    }

    pub fn union(&self, other: &CType) -> CType {
        match (self, other) {
            (CType::Any, _) | (_, CType::Any) => CType::Any,
            (CType::Union(a), CType::Union(b)) => {
                Self::normalize(a.iter().chain(b.iter()).cloned().collect())
            }
        }
    }

    pub fn intersection(&self, other: &CType) -> CType {
        match (self, other) {
            (CType::Any, t) | (t, CType::Any) => t.clone(),
            (CType::Union(a), CType::Union(b)) => Self::normalize(
                a.iter()
                    .cartesian_product(b.iter())
                    .filter_map(|(x, y)| intersect_atoms(x, y))
                    .collect(),
            ),
        }
    }

    pub fn intersects(&self, other: &CType) -> bool {
        !self.intersection(other).is_nothing()
    }

    /// Conservative subtype test: `true` means every value of `self` is
    /// certainly a value of `other`.
    pub fn is_subtype_of(&self, other: &CType) -> bool {
        match (self, other) {
            (_, CType::Any) => true,
            (CType::Any, CType::Union(_)) => false,
            (CType::Union(atoms), _) => atoms.iter().all(|atom| atom_subtype(atom, other)),
        }
    }

    /// `self` minus `other`. `None` when the exact difference can not be
    /// represented (the universal type minus anything, or a compound atom
    /// partially overlapping `other`).
    pub fn difference(&self, other: &CType) -> Option<CType> {
        match (self, other) {
            (_, CType::Any) => Some(CType::nothing()),
            (CType::Any, CType::Union(b)) if b.is_empty() => Some(CType::Any),
            (CType::Any, CType::Union(_)) => None,
            (CType::Union(atoms), CType::Union(_)) => {
                let mut result = Vec::new();

                for atom in atoms {
                    if atom_subtype(atom, other) {
                        continue;
                    }

                    let disjoint = other
                        .atoms()
                        .iter()
                        .all(|o| intersect_atoms(atom, o).is_none());

                    if disjoint {
                        result.push(atom.clone());
                        continue;
                    }

                    match atom {
                        Atom::Integer { low, high } => {
                            result.extend(subtract_ranges(*low, *high, other.atoms()));
                        }
                        // Simple atoms are either covered or disjoint, so only
                        // compound atoms get here
                        _ => return None,
                    }
                }

                Some(Self::normalize(result))
            }
        }
    }

    pub fn equivalent(&self, other: &CType) -> bool {
        self.is_subtype_of(other) && other.is_subtype_of(self)
    }
}

fn subtract_ranges(low: Option<i64>, high: Option<i64>, others: &[Atom]) -> Vec<Atom> {
    let mut pieces = vec![(low, high)];

    for other in others {
        let Atom::Integer {
            low: o_low,
            high: o_high,
        } = other
        else {
            continue;
        };

        pieces = pieces
            .into_iter()
            .flat_map(|(l, h)| {
                let mut out = Vec::new();

                // Part below the removed range
                if let Some(below) = o_low.and_then(|ol| ol.checked_sub(1)) {
                    if low_le(l, Some(below)) {
                        let upper = min_high(h, Some(below));
                        if Atom::integer(l, upper).is_some() {
                            out.push((l, upper));
                        }
                    }
                }

                // Part above the removed range
                if let Some(above) = o_high.and_then(|oh| oh.checked_add(1)) {
                    if high_ge(h, Some(above)) {
                        let lower = max_low(l, Some(above));
                        if Atom::integer(lower, h).is_some() {
                            out.push((lower, h));
                        }
                    }
                }

                out
            })
            .collect();
    }

    pieces
        .into_iter()
        .map(|(low, high)| Atom::Integer { low, high })
        .collect()
}

fn atom_subtype_of_atom(atom: &Atom, other: &Atom) -> bool {
    match (atom, other) {
        (
            Atom::Integer { low, high },
            Atom::Integer {
                low: o_low,
                high: o_high,
            },
        ) => low_le(*o_low, *low) && high_ge(*o_high, *high),
        (
            Atom::Cons { car, cdr },
            Atom::Cons {
                car: o_car,
                cdr: o_cdr,
            },
        ) => car.is_subtype_of(o_car) && cdr.is_subtype_of(o_cdr),
        (Atom::Vector(e), Atom::Vector(o)) => e.is_subtype_of(o),
        (a, b) => a == b,
    }
}

fn atom_subtype(atom: &Atom, other: &CType) -> bool {
    match other {
        CType::Any => true,
        CType::Union(atoms) => atoms.iter().any(|o| atom_subtype_of_atom(atom, o)),
    }
}

fn intersect_atoms(a: &Atom, b: &Atom) -> Option<Atom> {
    match (a, b) {
        (
            Atom::Integer { low, high },
            Atom::Integer {
                low: o_low,
                high: o_high,
            },
        ) => Atom::integer(max_low(*low, *o_low), min_high(*high, *o_high)),
        (
            Atom::Cons { car, cdr },
            Atom::Cons {
                car: o_car,
                cdr: o_cdr,
            },
        ) => {
            let car = car.intersection(o_car);
            let cdr = cdr.intersection(o_cdr);

            if car.is_nothing() || cdr.is_nothing() {
                None
            } else {
                Some(Atom::Cons {
                    car: Box::new(car),
                    cdr: Box::new(cdr),
                })
            }
        }
        (Atom::Vector(e), Atom::Vector(o)) => Some(Atom::Vector(Box::new(e.intersection(o)))),
        (a, b) if a == b => Some(a.clone()),
        _ => None,
    }
}

impl core::fmt::Display for Atom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Atom::Integer {
                low: Some(FIXNUM_MIN),
                high: Some(FIXNUM_MAX),
            } => write!(f, "fixnum"),
            Atom::Integer {
                low: None,
                high: None,
            } => write!(f, "integer"),
            Atom::Integer { low, high } => {
                let bound = |b: &Option<i64>| b.map(|b| b.to_string()).unwrap_or("*".to_owned());
                write!(f, "(integer {} {})", bound(low), bound(high))
            }
            Atom::Float => write!(f, "float"),
            Atom::Character => write!(f, "character"),
            Atom::Null => write!(f, "null"),
            Atom::Symbol => write!(f, "symbol"),
            Atom::String => write!(f, "string"),
            Atom::Function => write!(f, "function"),
            Atom::Cons { car, cdr } => write!(f, "(cons {car} {cdr})"),
            Atom::Vector(element) => write!(f, "(vector {element})"),
        }
    }
}

impl core::fmt::Display for CType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CType::Any => write!(f, "t"),
            CType::Union(atoms) => match atoms.as_slice() {
                [] => write!(f, "nil"),
                [atom] => write!(f, "{atom}"),
                atoms => write!(f, "(or {})", atoms.iter().join(" ")),
            },
        }
    }
}

/// The type of the values delivered along one edge: a fixed list of
/// required values and, when the count is not statically known, the type
/// of any further values.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ValuesType {
    pub required: Vec<CType>,
    pub rest: Option<CType>,
}

impl ValuesType {
    /// Any number of values of any type. Asserting it checks nothing.
    pub fn wild() -> Self {
        Self {
            required: Vec::new(),
            rest: Some(CType::Any),
        }
    }

    pub fn single(ty: CType) -> Self {
        Self {
            required: vec![ty],
            rest: None,
        }
    }

    pub fn fixed(types: Vec<CType>) -> Self {
        Self {
            required: types,
            rest: None,
        }
    }

    /// The type of a node that never delivers a value (for example an
    /// error call)
    pub fn nothing() -> Self {
        Self::single(CType::nothing())
    }

    pub fn is_wild(&self) -> bool {
        self.required.iter().all(CType::is_any) && matches!(self.rest, Some(CType::Any))
    }

    pub fn is_nothing(&self) -> bool {
        self.required.iter().any(CType::is_nothing)
    }

    /// Statically known number of values
    pub fn value_count(&self) -> Option<usize> {
        match self.rest {
            None => Some(self.required.len()),
            Some(_) => None,
        }
    }

    /// Type of the `index`th value. Values past the end of a fixed count
    /// read as `null`.
    pub fn nth(&self, index: usize) -> CType {
        match self.required.get(index) {
            Some(ty) => ty.clone(),
            None => self.rest.clone().unwrap_or_else(CType::null),
        }
    }

    pub fn single_value_type(&self) -> CType {
        self.nth(0)
    }

    /// The types of the first `count` values
    pub fn values_out(&self, count: usize) -> Vec<CType> {
        (0..count).map(|i| self.nth(i)).collect()
    }

    fn zip_with(&self, other: &Self, f: impl Fn(&CType, &CType) -> CType) -> Self {
        let length = self.required.len().max(other.required.len());
        let required = (0..length).map(|i| f(&self.nth(i), &other.nth(i))).collect();

        let rest = match (&self.rest, &other.rest) {
            (None, None) => None,
            (a, b) => {
                let a = a.clone().unwrap_or_else(CType::null);
                let b = b.clone().unwrap_or_else(CType::null);
                Some(f(&a, &b))
            }
        };

        Self { required, rest }
    }

    pub fn union(&self, other: &Self) -> Self {
        if self.is_nothing() {
            return other.clone();
        }

        if other.is_nothing() {
            return self.clone();
        }

        self.zip_with(other, CType::union)
    }

    pub fn intersection(&self, other: &Self) -> Self {
        let mut result = self.zip_with(other, CType::intersection);

        // A fixed count on either side bounds the result
        if self.rest.is_none() || other.rest.is_none() {
            result.rest = None;
        }

        result
    }

    pub fn is_subtype_of(&self, other: &Self) -> bool {
        let length = self.required.len().max(other.required.len());

        let required_ok = (0..length).all(|i| self.nth(i).is_subtype_of(&other.nth(i)));

        let rest_ok = match (&self.rest, &other.rest) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(a), Some(b)) => a.is_subtype_of(b),
        };

        required_ok && rest_ok
    }
}

impl core::fmt::Display for ValuesType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.required.as_slice(), &self.rest) {
            (_, _) if self.is_wild() => write!(f, "*"),
            ([single], None) => write!(f, "{single}"),
            (required, rest) => {
                write!(f, "(values")?;
                for ty in required {
                    write!(f, " {ty}")?;
                }
                if let Some(rest) = rest {
                    write!(f, " &rest {rest}")?;
                }
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn union_merges_touching_ranges() {
        let a = CType::int_range(Some(0), Some(10));
        let b = CType::int_range(Some(11), Some(20));

        assert_eq!(a.union(&b), CType::int_range(Some(0), Some(20)));
    }

    #[test]
    fn fixnum_is_an_integer_but_not_the_reverse() {
        assert!(CType::fixnum().is_subtype_of(&CType::integer()));
        assert!(!CType::integer().is_subtype_of(&CType::fixnum()));
        assert!(CType::nothing().is_subtype_of(&CType::fixnum()));
        assert!(!CType::Any.is_subtype_of(&CType::symbol()));
    }

    #[test]
    fn difference_splits_integer_ranges() {
        let diff = CType::integer()
            .difference(&CType::int_range(Some(0), Some(10)))
            .unwrap();

        assert_eq!(
            diff,
            CType::int_range(None, Some(-1)).union(&CType::int_range(Some(11), None))
        );
        assert_eq!(diff.to_string(), "(or (integer * -1) (integer 11 *))");
    }

    #[test]
    fn difference_of_disjoint_atoms_keeps_them() {
        let derived = CType::fixnum().union(&CType::symbol()).union(&CType::float());
        let required = CType::fixnum().union(&CType::symbol());

        assert_eq!(derived.difference(&required), Some(CType::float()));
    }

    #[test]
    fn difference_from_universal_is_unrepresentable() {
        assert_eq!(CType::Any.difference(&CType::fixnum()), None);
        assert_eq!(
            CType::cons(CType::Any, CType::Any).difference(&CType::cons(CType::fixnum(), CType::Any)),
            None
        );
    }

    #[test]
    fn intersection_of_cons_types_is_elementwise() {
        let a = CType::cons(CType::integer(), CType::Any);
        let b = CType::cons(CType::Any, CType::null());

        assert_eq!(a.intersection(&b), CType::cons(CType::integer(), CType::null()));
        assert!(CType::cons(CType::symbol(), CType::Any)
            .intersection(&CType::cons(CType::fixnum(), CType::Any))
            .is_nothing());
    }

    #[test]
    fn list_absorbs_specific_conses() {
        let list = CType::list().union(&CType::cons(CType::fixnum(), CType::null()));

        assert_eq!(list, CType::list());
        assert!(list.is_union());
        assert_eq!(list.to_string(), "(or null (cons t t))");
    }

    #[test]
    fn values_types_pad_missing_values_with_null() {
        let two = ValuesType::fixed(vec![CType::fixnum(), CType::symbol()]);

        assert_eq!(two.value_count(), Some(2));
        assert_eq!(two.nth(2), CType::null());
        assert_eq!(ValuesType::wild().value_count(), None);
        assert!(ValuesType::single(CType::fixnum()).is_subtype_of(&ValuesType::wild()));
        assert!(!ValuesType::wild().is_subtype_of(&ValuesType::single(CType::fixnum())));
    }
}
