//! GLSL compute preamble generation.
//!
//! User shaders are written against the buffers registered on a thread
//! context. Before compiling, the assembler prepends a preamble that
//! declares every buffer as an `std430` storage block bound at its buffer
//! ID, plus a flattened invocation index:
//!
//! ```glsl
//! #version 430
//! layout(local_size_x = 1, local_size_y = 1, local_size_z = 1) in;
//! layout(std430, binding = 0) buffer CinderBuffer0 { float A[]; };
//! uint JobIndex = ...;
//! result = A[0];
//! ```

use crate::buffer::ElementType;
use crate::driver::BufferId;

pub const VERSION_DIRECTIVE: &str = "#version 430\n";

/// One invocation per workgroup; the dispatch grid carries the job count.
pub const LAYOUT_DIRECTIVE: &str =
    "layout(local_size_x = 1, local_size_y = 1, local_size_z = 1) in;\n";

/// Identifier of the built-in flattened invocation index.
pub const JOB_INDEX_NAME: &str = "JobIndex";

/// Declaration of [`JOB_INDEX_NAME`]. Row-major over (x, y, z), matching
/// the order [`crate::driver::DeviceLimits::split`] fills the grid in.
pub const JOB_INDEX_DECL: &str = "uint JobIndex = (gl_GlobalInvocationID.x * (gl_NumWorkGroups.y * gl_NumWorkGroups.z)) + (gl_GlobalInvocationID.y * gl_NumWorkGroups.z) + gl_GlobalInvocationID.z;\n";

/// Prefix of the generated storage block names.
pub const BLOCK_PREFIX: &str = "CinderBuffer";

/// A buffer as seen by the assembler.
#[derive(Debug, Clone, Copy)]
pub struct BufferDecl<'a> {
    pub id: BufferId,
    pub name: &'a str,
    pub element: &'a ElementType,
}

/// Storage block declaration for one buffer.
pub fn emit_buffer_block(decl: &BufferDecl<'_>) -> String {
    let suffix = if decl.element.array { "[]" } else { "" };
    format!(
        "layout(std430, binding = {id}) buffer {prefix}{id} {{ {ty} {name}{suffix}; }};\n",
        id = decl.id,
        prefix = BLOCK_PREFIX,
        ty = decl.element.base,
        name = decl.name,
        suffix = suffix,
    )
}

/// Build the final shader text. Blocks are emitted in slice order.
pub fn assemble(buffers: &[BufferDecl<'_>], user_source: &str, custom_types: Option<&str>) -> String {
    let mut out = String::with_capacity(
        VERSION_DIRECTIVE.len()
            + LAYOUT_DIRECTIVE.len()
            + JOB_INDEX_DECL.len()
            + buffers.len() * 80
            + custom_types.map_or(0, str::len)
            + user_source.len()
            + 1,
    );

    out.push_str(VERSION_DIRECTIVE);
    out.push_str(LAYOUT_DIRECTIVE);

    if let Some(types) = custom_types.filter(|t| !t.is_empty()) {
        out.push_str(types);
        if !types.ends_with('\n') {
            out.push('\n');
        }
    }

    for decl in buffers {
        out.push_str(&emit_buffer_block(decl));
    }

    out.push_str(JOB_INDEX_DECL);
    out.push_str(user_source);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(base: &str, array: bool) -> ElementType {
        ElementType {
            base: base.to_string(),
            array,
        }
    }

    #[test]
    fn test_emit_array_and_scalar_blocks() {
        let floats = element("float", true);
        let scale = element("double", false);
        assert_eq!(
            emit_buffer_block(&BufferDecl {
                id: 0,
                name: "A",
                element: &floats
            }),
            "layout(std430, binding = 0) buffer CinderBuffer0 { float A[]; };\n"
        );
        assert_eq!(
            emit_buffer_block(&BufferDecl {
                id: 7,
                name: "scale",
                element: &scale
            }),
            "layout(std430, binding = 7) buffer CinderBuffer7 { double scale; };\n"
        );
    }

    #[test]
    fn test_assemble_layout() {
        let floats = element("float", true);
        let particles = element("Particle", true);
        let decls = [
            BufferDecl {
                id: 0,
                name: "A",
                element: &floats,
            },
            BufferDecl {
                id: 2,
                name: "ps",
                element: &particles,
            },
        ];
        let types = "struct Particle { vec4 pos; };";
        let src = assemble(&decls, "void main() { A[JobIndex] = 1.0; }", Some(types));

        let expected = format!(
            "{}{}{}\n{}{}{}void main() {{ A[JobIndex] = 1.0; }}",
            VERSION_DIRECTIVE,
            LAYOUT_DIRECTIVE,
            types,
            "layout(std430, binding = 0) buffer CinderBuffer0 { float A[]; };\n",
            "layout(std430, binding = 2) buffer CinderBuffer2 { Particle ps[]; };\n",
            JOB_INDEX_DECL,
        );
        assert_eq!(src, expected);
    }

    #[test]
    fn test_no_buffers_no_types() {
        let src = assemble(&[], "void main() {}", None);
        assert_eq!(
            src,
            format!(
                "{}{}{}void main() {{}}",
                VERSION_DIRECTIVE, LAYOUT_DIRECTIVE, JOB_INDEX_DECL
            )
        );
    }

    #[test]
    fn test_custom_types_keep_trailing_newline() {
        let src = assemble(&[], "", Some("struct S { int a; };\n"));
        assert!(src.contains("struct S { int a; };\nuint JobIndex"));
        assert!(!src.contains("};\n\n"));
    }
}
