//! Symbol demangling for resolved frames.

/// Demangle a raw symbol name. Rust symbols are tried first (legacy Rust
/// mangling is a superset of the Itanium scheme), then the platform C++ ABI
/// for `_Z`-prefixed names. Anything else, or a failed demangle, passes
/// through unchanged.
pub fn demangle(name: &str) -> String {
    if let Ok(demangled) = rustc_demangle::try_demangle(name) {
        return format!("{demangled:#}");
    }

    if name.starts_with("_Z") {
        if let Ok(symbol) = cpp_demangle::Symbol::new(name) {
            let options = cpp_demangle::DemangleOptions::default().no_return_type();
            if let Ok(demangled) = symbol.demangle_with_options(&options) {
                return demangled;
            }
        }
    }

    name.to_owned()
}

#[cfg(test)]
mod tests {
    use super::demangle;

    #[test]
    fn cpp_symbol() {
        assert_eq!(
            demangle("_ZNK8KxVectorI16KxfArcFileRecordjEixEj"),
            "KxVector<KxfArcFileRecord, unsigned int>::operator[](unsigned int) const"
        );
    }

    #[test]
    fn rust_symbol() {
        assert_eq!(
            demangle("_ZN4core3ptr13drop_in_place17h1234567890abcdefE"),
            "core::ptr::drop_in_place"
        );
    }

    #[test]
    fn plain_symbol_passes_through() {
        assert_eq!(demangle("main"), "main");
        assert_eq!(demangle("_not_mangled"), "_not_mangled");
    }
}
