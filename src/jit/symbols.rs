//! Symbol hygiene for linked modules.
//!
//! Generated translation units share helper constructor and destructor
//! names by compiler convention, so two JIT rounds loaded into one process
//! would collide. After the relocatable link, the merged object is
//! rewritten: every definition in the uniquify set is renamed to
//! `<original>.<address>` and forced to external linkage, every other named
//! defined global is internalized, and one exported symbol is picked as the
//! materialization trigger for the loader.
//!
//! The rewrite rebuilds the object file section by section, carrying data,
//! symbols, relocations, and COMDAT groups over while applying the renames.

use std::collections::BTreeSet;

use object::{
    Object, ObjectComdat, ObjectSection, ObjectSymbol, RelocationTarget, SectionIndex,
    SectionKind, SymbolFlags, SymbolIndex, SymbolKind, SymbolScope, SymbolSection,
};
use rustc_hash::FxHashMap;

use crate::error::{HError, HResult};

/// Sections that describe the symbol table we are rebuilding, or that hold
/// symbol indices that would go stale. They are reconstructed by the
/// writer, not copied.
fn skip_section(name: &str, kind: SectionKind) -> bool {
    if kind == SectionKind::Metadata {
        return true;
    }
    if let SectionKind::Elf(sht) = kind {
        if sht == object::elf::SHT_GROUP {
            return true;
        }
    }
    matches!(name, ".symtab" | ".strtab" | ".shstrtab" | ".llvm_addrsig" | ".group")
}

/// Collect the names of all global constructors and destructors defined in
/// the module: every defined symbol referenced from an init/fini array,
/// plus the compiler's constructor naming conventions as a fallback for
/// entries that relocate through section symbols.
pub(crate) fn collect_constructor_symbols(file: &object::File) -> BTreeSet<String> {
    let mut out = BTreeSet::new();

    for section in file.sections() {
        let name = section.name().unwrap_or("");
        if !(name.starts_with(".init_array")
            || name.starts_with(".fini_array")
            || name == ".ctors"
            || name == ".dtors")
        {
            continue;
        }
        for (_offset, rel) in section.relocations() {
            if let RelocationTarget::Symbol(idx) = rel.target() {
                if let Ok(sym) = file.symbol_by_index(idx) {
                    if let Ok(sym_name) = sym.name() {
                        if !sym_name.is_empty() {
                            out.insert(sym_name.to_string());
                        }
                    }
                }
            }
        }
    }

    for sym in file.symbols() {
        if !sym.is_definition() {
            continue;
        }
        if let Ok(name) = sym.name() {
            if name.starts_with("_GLOBAL__sub_I_")
                || name.starts_with("_GLOBAL__sub_D_")
                || name.starts_with("__cxx_global_var_init")
            {
                out.insert(name.to_string());
            }
        }
    }

    out
}

/// Result of the visibility rewrite.
pub(crate) struct RewriteOutcome {
    /// The rewritten object file.
    pub bytes: Vec<u8>,
    /// Old-to-new names for the uniquified symbols.
    pub renamed: FxHashMap<String, String>,
    /// All externally visible symbols after the rewrite.
    pub exported: BTreeSet<String>,
    /// The symbol the loader resolves first to force materialization; any
    /// exported symbol suffices. `None` for an empty module.
    pub trigger: Option<String>,
}

/// Rewrite the merged module's symbol visibility.
///
/// Definitions named in `uniquify` are renamed to `<name>.<tag as hex>` and
/// exported even if they were internal; definitions named in `expose` stay
/// exported under their own name; every other named defined global is
/// internalized. Unnamed globals are left alone. `note` optionally embeds
/// an extra data section (the version record) into the rewritten object.
pub(crate) fn adapt_symbol_visibility(
    file: &object::File,
    uniquify: &BTreeSet<String>,
    expose: &BTreeSet<String>,
    tag: usize,
    note: Option<(&str, &[u8])>,
) -> HResult<RewriteOutcome> {
    let emit_err = |what: &str, detail: String| {
        HError::object_emit_failed(format!("{}: {}", what, detail))
    };

    let mut out = object::write::Object::new(file.format(), file.architecture(), file.endianness());

    // Sections.
    let mut section_map: FxHashMap<SectionIndex, object::write::SectionId> = FxHashMap::default();
    for section in file.sections() {
        let name = section
            .name()
            .map_err(|e| emit_err("unreadable section name", e.to_string()))?;
        let kind = section.kind();
        if skip_section(name, kind) {
            continue;
        }

        let segment = section
            .segment_name()
            .ok()
            .flatten()
            .map(|s| s.as_bytes().to_vec())
            .unwrap_or_default();
        let id = out.add_section(segment, name.as_bytes().to_vec(), kind);

        match kind {
            SectionKind::UninitializedData | SectionKind::UninitializedTls | SectionKind::Common => {
                out.append_section_bss(id, section.size(), section.align().max(1));
            }
            _ => {
                let data = section
                    .data()
                    .map_err(|e| emit_err("unreadable section data", e.to_string()))?;
                out.set_section_data(id, data.to_vec(), section.align().max(1));
            }
        }
        section_map.insert(section.index(), id);
    }

    if let Some((name, data)) = note {
        let id = out.add_section(Vec::new(), name.as_bytes().to_vec(), SectionKind::ReadOnlyData);
        out.set_section_data(id, data.to_vec(), 1);
    }

    // Symbols, applying the rename and visibility rules.
    let mut symbol_map: FxHashMap<SymbolIndex, object::write::SymbolId> = FxHashMap::default();
    let mut section_symbols: FxHashMap<SymbolIndex, SectionIndex> = FxHashMap::default();
    let mut renamed: FxHashMap<String, String> = FxHashMap::default();
    let mut defined_names: BTreeSet<String> = BTreeSet::new();

    for sym in file.symbols() {
        match sym.kind() {
            SymbolKind::File => continue,
            SymbolKind::Section => {
                if let SymbolSection::Section(idx) = sym.section() {
                    section_symbols.insert(sym.index(), idx);
                }
                continue;
            }
            _ => {}
        }

        let name = sym.name().unwrap_or("");

        let (out_section, value) = match sym.section() {
            SymbolSection::Section(idx) => match section_map.get(&idx) {
                Some(&id) => {
                    let base = file
                        .section_by_index(idx)
                        .map(|s| s.address())
                        .unwrap_or(0);
                    (object::write::SymbolSection::Section(id), sym.address() - base)
                }
                // Symbol of a section we dropped.
                None => continue,
            },
            SymbolSection::Undefined => (object::write::SymbolSection::Undefined, sym.address()),
            SymbolSection::Absolute => (object::write::SymbolSection::Absolute, sym.address()),
            SymbolSection::Common => (object::write::SymbolSection::Common, sym.address()),
            _ => (object::write::SymbolSection::None, sym.address()),
        };

        let defined = matches!(
            sym.section(),
            SymbolSection::Section(_) | SymbolSection::Absolute | SymbolSection::Common
        );
        if defined && !name.is_empty() {
            defined_names.insert(name.to_string());
        }

        let mut out_name = name.to_string();
        let mut scope = sym.scope();

        if defined && !name.is_empty() && uniquify.contains(name) {
            // Make the symbol unique within the process by embedding the
            // module tag into its name, and export it: constructors come
            // out of the compiler as internal, but the loader must be able
            // to resolve them.
            out_name = format!("{}.0x{:x}", name, tag);
            renamed.insert(name.to_string(), out_name.clone());
            scope = SymbolScope::Dynamic;
        } else if defined && !name.is_empty() && expose.contains(name) {
            scope = SymbolScope::Dynamic;
        } else if defined && !name.is_empty() && sym.is_global() {
            scope = SymbolScope::Compilation;
        } else if matches!(sym.section(), SymbolSection::Undefined) {
            scope = SymbolScope::Dynamic;
        } else if scope == SymbolScope::Unknown {
            scope = SymbolScope::Compilation;
        }

        // The writer requires a concrete kind for defined symbols; readers
        // report local untyped data labels (e.g. compiler-generated
        // constant-pool entries like `.LC0`) as `Unknown`.
        let out_kind = if sym.kind() == SymbolKind::Unknown && defined {
            SymbolKind::Data
        } else {
            sym.kind()
        };

        let id = out.add_symbol(object::write::Symbol {
            name: out_name.into_bytes(),
            value,
            size: sym.size(),
            kind: out_kind,
            scope,
            weak: sym.is_weak(),
            section: out_section,
            flags: SymbolFlags::None,
        });
        symbol_map.insert(sym.index(), id);
    }

    // Relocations.
    for section in file.sections() {
        let Some(&out_sec) = section_map.get(&section.index()) else {
            continue;
        };
        for (offset, rel) in section.relocations() {
            let symbol = match rel.target() {
                RelocationTarget::Symbol(idx) => {
                    if let Some(&id) = symbol_map.get(&idx) {
                        id
                    } else if let Some(sec_idx) = section_symbols.get(&idx) {
                        match section_map.get(sec_idx) {
                            Some(&sid) => out.section_symbol(sid),
                            None => {
                                return Err(emit_err(
                                    "relocation against dropped section",
                                    format!("{:?}", sec_idx),
                                ))
                            }
                        }
                    } else {
                        return Err(emit_err(
                            "relocation against unmapped symbol",
                            format!("{:?}", idx),
                        ));
                    }
                }
                RelocationTarget::Section(idx) => match section_map.get(&idx) {
                    Some(&sid) => out.section_symbol(sid),
                    None => {
                        return Err(emit_err(
                            "relocation against dropped section",
                            format!("{:?}", idx),
                        ))
                    }
                },
                target => {
                    return Err(emit_err("unsupported relocation target", format!("{:?}", target)))
                }
            };
            out.add_relocation(
                out_sec,
                object::write::Relocation {
                    offset,
                    symbol,
                    addend: rel.addend(),
                    flags: rel.flags(),
                },
            )
            .map_err(|e| emit_err("relocation rewrite failed", e.to_string()))?;
        }
    }

    // COMDAT groups.
    for comdat in file.comdats() {
        let Some(&symbol) = symbol_map.get(&comdat.symbol()) else {
            continue;
        };
        let sections: Vec<_> = comdat
            .sections()
            .filter_map(|idx| section_map.get(&idx).copied())
            .collect();
        out.add_comdat(object::write::Comdat {
            kind: comdat.kind(),
            symbol,
            sections,
        });
    }

    let bytes = out
        .write()
        .map_err(|e| emit_err("object serialization failed", e.to_string()))?;

    let mut exported: BTreeSet<String> = renamed.values().cloned().collect();
    for name in expose {
        if defined_names.contains(name) {
            exported.insert(name.clone());
        }
    }
    let trigger = exported.iter().next().cloned();

    Ok(RewriteOutcome {
        bytes,
        renamed,
        exported,
        trigger,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::{
        Architecture, BinaryFormat, Endianness, RelocationEncoding, RelocationFlags,
        RelocationKind,
    };

    /// A synthetic relocatable object shaped like merged generated code:
    /// an exported entry point, a local constructor referenced from
    /// `.init_array`, and an exported helper.
    fn sample_object() -> Vec<u8> {
        let mut obj =
            object::write::Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);

        let text = obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
        obj.set_section_data(text, vec![0xc3; 32], 16);

        obj.add_symbol(object::write::Symbol {
            name: b"hilti_main".to_vec(),
            value: 0,
            size: 4,
            kind: SymbolKind::Text,
            scope: SymbolScope::Dynamic,
            weak: false,
            section: object::write::SymbolSection::Section(text),
            flags: SymbolFlags::None,
        });

        let ctor = obj.add_symbol(object::write::Symbol {
            name: b"_GLOBAL__sub_I_unit".to_vec(),
            value: 8,
            size: 4,
            kind: SymbolKind::Text,
            scope: SymbolScope::Compilation,
            weak: false,
            section: object::write::SymbolSection::Section(text),
            flags: SymbolFlags::None,
        });

        obj.add_symbol(object::write::Symbol {
            name: b"helper".to_vec(),
            value: 16,
            size: 4,
            kind: SymbolKind::Text,
            scope: SymbolScope::Dynamic,
            weak: false,
            section: object::write::SymbolSection::Section(text),
            flags: SymbolFlags::None,
        });

        let init = obj.add_section(Vec::new(), b".init_array".to_vec(), SectionKind::Data);
        obj.set_section_data(init, vec![0u8; 8], 8);
        obj.add_relocation(
            init,
            object::write::Relocation {
                offset: 0,
                symbol: ctor,
                addend: 0,
                flags: RelocationFlags::Generic {
                    kind: RelocationKind::Absolute,
                    encoding: RelocationEncoding::Generic,
                    size: 64,
                },
            },
        )
        .unwrap();

        obj.write().unwrap()
    }

    fn rewrite(tag: usize) -> RewriteOutcome {
        let data = sample_object();
        let file = object::File::parse(&*data).unwrap();
        let mut uniquify = collect_constructor_symbols(&file);
        uniquify.insert("__linker__".to_string());
        let expose: BTreeSet<String> = ["hilti_main".to_string()].into_iter().collect();
        adapt_symbol_visibility(&file, &uniquify, &expose, tag, Some((".hlto.version", b"{}")))
            .unwrap()
    }

    #[test]
    fn test_collects_init_array_constructors() {
        let data = sample_object();
        let file = object::File::parse(&*data).unwrap();
        let ctors = collect_constructor_symbols(&file);
        assert!(ctors.contains("_GLOBAL__sub_I_unit"));
        assert!(!ctors.contains("hilti_main"));
        assert!(!ctors.contains("helper"));
    }

    #[test]
    fn test_constructor_renamed_and_exported() {
        let outcome = rewrite(0x2a);
        assert_eq!(
            outcome.renamed.get("_GLOBAL__sub_I_unit").map(String::as_str),
            Some("_GLOBAL__sub_I_unit.0x2a")
        );

        let file = object::File::parse(&*outcome.bytes).unwrap();
        let ctor = file
            .symbols()
            .find(|s| s.name() == Ok("_GLOBAL__sub_I_unit.0x2a"))
            .expect("renamed constructor present");
        // The constructor came in as internal; it must now be resolvable
        // from outside the object.
        assert!(ctor.is_global());
        assert!(file
            .symbols()
            .all(|s| s.name() != Ok("_GLOBAL__sub_I_unit")));
    }

    #[test]
    fn test_other_globals_internalized() {
        let outcome = rewrite(1);
        let file = object::File::parse(&*outcome.bytes).unwrap();

        let helper = file
            .symbols()
            .find(|s| s.name() == Ok("helper"))
            .expect("helper present");
        assert!(helper.is_local());

        let main = file
            .symbols()
            .find(|s| s.name() == Ok("hilti_main"))
            .expect("entry present");
        assert!(main.is_global());
    }

    #[test]
    fn test_exported_union_and_trigger() {
        let outcome = rewrite(0x2a);
        assert!(outcome.exported.contains("hilti_main"));
        assert!(outcome.exported.contains("_GLOBAL__sub_I_unit.0x2a"));
        let trigger = outcome.trigger.expect("non-empty module has a trigger");
        assert!(outcome.exported.contains(&trigger));
    }

    #[test]
    fn test_init_array_relocation_follows_rename() {
        let outcome = rewrite(0x2a);
        let file = object::File::parse(&*outcome.bytes).unwrap();

        let init = file
            .sections()
            .find(|s| s.name() == Ok(".init_array"))
            .expect("init array kept");
        let relocs: Vec<_> = init.relocations().collect();
        assert_eq!(relocs.len(), 1);
        match relocs[0].1.target() {
            RelocationTarget::Symbol(idx) => {
                let sym = file.symbol_by_index(idx).unwrap();
                assert_eq!(sym.name(), Ok("_GLOBAL__sub_I_unit.0x2a"));
            }
            other => panic!("unexpected relocation target {:?}", other),
        }
    }

    #[test]
    fn test_version_note_embedded() {
        let outcome = rewrite(7);
        let file = object::File::parse(&*outcome.bytes).unwrap();
        let section = file
            .section_by_name(".hlto.version")
            .expect("version record embedded");
        assert_eq!(section.data().unwrap(), b"{}");
    }

    #[test]
    fn test_distinct_tags_give_distinct_names() {
        let a = rewrite(0x1000);
        let b = rewrite(0x2000);
        let name_a = a.renamed.get("_GLOBAL__sub_I_unit").unwrap();
        let name_b = b.renamed.get("_GLOBAL__sub_I_unit").unwrap();
        assert_ne!(name_a, name_b);
    }

    #[test]
    fn test_empty_module_has_no_trigger() {
        let mut obj =
            object::write::Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
        let text = obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
        obj.set_section_data(text, Vec::new(), 1);
        let data = obj.write().unwrap();

        let file = object::File::parse(&*data).unwrap();
        let uniquify = BTreeSet::new();
        let expose: BTreeSet<String> = ["hilti_main".to_string()].into_iter().collect();
        let outcome = adapt_symbol_visibility(&file, &uniquify, &expose, 1, None).unwrap();
        assert!(outcome.trigger.is_none());
        assert!(outcome.exported.is_empty());
    }
}
