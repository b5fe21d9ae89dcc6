//
// toolchain/universe.rs
//
// Predeclared identifiers of the universe block
//

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinKind {
    Type,
    Const,
    Func,
}

#[derive(Debug, Clone, Copy)]
pub struct Builtin {
    pub name: &'static str,
    pub kind: BuiltinKind,
    pub signature: &'static str,
}

const fn ty(name: &'static str, signature: &'static str) -> Builtin {
    Builtin {
        name,
        kind: BuiltinKind::Type,
        signature,
    }
}

const fn konst(name: &'static str, signature: &'static str) -> Builtin {
    Builtin {
        name,
        kind: BuiltinKind::Const,
        signature,
    }
}

const fn func(name: &'static str, signature: &'static str) -> Builtin {
    Builtin {
        name,
        kind: BuiltinKind::Func,
        signature,
    }
}

pub const BUILTINS: &[Builtin] = &[
    ty("any", "type any = interface{}"),
    ty("bool", "type bool bool"),
    ty("byte", "type byte = uint8"),
    ty("comparable", "type comparable interface{ comparable }"),
    ty("complex64", "type complex64 complex64"),
    ty("complex128", "type complex128 complex128"),
    ty("error", "type error interface {\n\tError() string\n}"),
    ty("float32", "type float32 float32"),
    ty("float64", "type float64 float64"),
    ty("int", "type int int"),
    ty("int8", "type int8 int8"),
    ty("int16", "type int16 int16"),
    ty("int32", "type int32 int32"),
    ty("int64", "type int64 int64"),
    ty("rune", "type rune = int32"),
    ty("string", "type string string"),
    ty("uint", "type uint uint"),
    ty("uint8", "type uint8 uint8"),
    ty("uint16", "type uint16 uint16"),
    ty("uint32", "type uint32 uint32"),
    ty("uint64", "type uint64 uint64"),
    ty("uintptr", "type uintptr uintptr"),
    konst("true", "const true untyped bool"),
    konst("false", "const false untyped bool"),
    konst("iota", "const iota untyped int"),
    konst("nil", "var nil Type"),
    func("append", "func append(slice []Type, elems ...Type) []Type"),
    func("cap", "func cap(v Type) int"),
    func("clear", "func clear[T ~[]Type | ~map[Type]Type1](t T)"),
    func("close", "func close(c chan<- Type)"),
    func("complex", "func complex(r, i FloatType) ComplexType"),
    func("copy", "func copy(dst, src []Type) int"),
    func("delete", "func delete(m map[Type]Type1, key Type)"),
    func("imag", "func imag(c ComplexType) FloatType"),
    func("len", "func len(v Type) int"),
    func("make", "func make(t Type, size ...IntegerType) Type"),
    func("max", "func max[T cmp.Ordered](x T, y ...T) T"),
    func("min", "func min[T cmp.Ordered](x T, y ...T) T"),
    func("new", "func new(Type) *Type"),
    func("panic", "func panic(v any)"),
    func("print", "func print(args ...Type)"),
    func("println", "func println(args ...Type)"),
    func("real", "func real(c ComplexType) FloatType"),
    func("recover", "func recover() any"),
];

pub fn lookup(name: &str) -> Option<&'static Builtin> {
    BUILTINS.iter().find(|b| b.name == name)
}

pub fn is_predeclared(name: &str) -> bool {
    lookup(name).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        assert_eq!(lookup("len").map(|b| b.kind), Some(BuiltinKind::Func));
        assert_eq!(lookup("error").map(|b| b.kind), Some(BuiltinKind::Type));
        assert!(is_predeclared("iota"));
        assert!(!is_predeclared("fmt"));
    }
}
