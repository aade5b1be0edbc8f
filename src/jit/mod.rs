//! Native code generation.
//!
//! [`compile`] turns a Taylor decomposition into an in-memory Cranelift
//! module holding the jet function(s) and the Estrin state-update
//! function(s), and hands the stepper typed function pointers plus the
//! textual IR for inspection. The module owns the emitted code; the
//! pointers are valid exactly as long as the [`CompiledModule`] lives.

use std::collections::HashMap;

use cranelift::codegen;
use cranelift::codegen::settings::{self, Configurable};
use cranelift::prelude::{AbiParam, FunctionBuilder, FunctionBuilderContext, InstBuilder, Value};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{FuncId, Linkage, Module};
use log::debug;

use crate::decompose::Decomposition;
use crate::error::Error;
use crate::float::{JitFloat, MathSymbols};

pub(crate) mod jet;
pub(crate) mod update;

/// Jet function: `(jet_buf, pars, time)`.
pub(crate) type JetFn<F> = unsafe extern "C" fn(*mut F, *const F, *const F);
/// Update function: `(out_state, jet_buf, h)`.
pub(crate) type UpdFn<F> = unsafe extern "C" fn(*mut F, *const F, *const F);

fn codegen_err(e: impl std::fmt::Display) -> Error {
    Error::Codegen(e.to_string())
}

// The generated code calls out for the transcendental intrinsics; the
// symbols are registered on the JIT builder with explicit extern "C" shims
// over libm, so resolution never depends on what the platform libc exports.
extern "C" fn sin_shim(x: f64) -> f64 {
    libm::sin(x)
}
extern "C" fn cos_shim(x: f64) -> f64 {
    libm::cos(x)
}
extern "C" fn exp_shim(x: f64) -> f64 {
    libm::exp(x)
}
extern "C" fn log_shim(x: f64) -> f64 {
    libm::log(x)
}
extern "C" fn pow_shim(x: f64, y: f64) -> f64 {
    libm::pow(x, y)
}
extern "C" fn erf_shim(x: f64) -> f64 {
    libm::erf(x)
}
extern "C" fn sinf_shim(x: f32) -> f32 {
    libm::sinf(x)
}
extern "C" fn cosf_shim(x: f32) -> f32 {
    libm::cosf(x)
}
extern "C" fn expf_shim(x: f32) -> f32 {
    libm::expf(x)
}
extern "C" fn logf_shim(x: f32) -> f32 {
    libm::logf(x)
}
extern "C" fn powf_shim(x: f32, y: f32) -> f32 {
    libm::powf(x, y)
}
extern "C" fn erff_shim(x: f32) -> f32 {
    libm::erff(x)
}

fn register_math_symbols(builder: &mut JITBuilder) {
    builder.symbol("sin", sin_shim as *const u8);
    builder.symbol("cos", cos_shim as *const u8);
    builder.symbol("exp", exp_shim as *const u8);
    builder.symbol("log", log_shim as *const u8);
    builder.symbol("pow", pow_shim as *const u8);
    builder.symbol("erf", erf_shim as *const u8);
    builder.symbol("sinf", sinf_shim as *const u8);
    builder.symbol("cosf", cosf_shim as *const u8);
    builder.symbol("expf", expf_shim as *const u8);
    builder.symbol("logf", logf_shim as *const u8);
    builder.symbol("powf", powf_shim as *const u8);
    builder.symbol("erff", erff_shim as *const u8);
}

/// An in-progress JIT module.
pub(crate) struct ModuleBuilder {
    module: JITModule,
    ctx: codegen::Context,
    fbcx: FunctionBuilderContext,
    clif: String,
    math_ids: HashMap<&'static str, FuncId>,
    ids: HashMap<String, FuncId>,
}

impl ModuleBuilder {
    pub(crate) fn new(opt_level: u32) -> Result<Self, Error> {
        let mut flags = settings::builder();
        flags
            .set("use_colocated_libcalls", "false")
            .map_err(codegen_err)?;
        flags.set("is_pic", "false").map_err(codegen_err)?;
        flags
            .set("opt_level", if opt_level == 0 { "none" } else { "speed" })
            .map_err(codegen_err)?;

        let isa_builder = cranelift_native::builder().map_err(codegen_err)?;
        let isa = isa_builder
            .finish(settings::Flags::new(flags))
            .map_err(codegen_err)?;

        let mut builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
        register_math_symbols(&mut builder);
        let module = JITModule::new(builder);
        let ctx = module.make_context();

        Ok(ModuleBuilder {
            module,
            ctx,
            fbcx: FunctionBuilderContext::new(),
            clif: String::new(),
            math_ids: HashMap::new(),
            ids: HashMap::new(),
        })
    }

    /// Declare the imported math routines for one float width.
    pub(crate) fn declare_math(&mut self, syms: MathSymbols, ty: cranelift::prelude::Type) -> Result<(), Error> {
        for (name, arity) in [
            (syms.sin, 1),
            (syms.cos, 1),
            (syms.exp, 1),
            (syms.log, 1),
            (syms.pow, 2),
            (syms.erf, 1),
        ] {
            let mut sig = self.module.make_signature();
            for _ in 0..arity {
                sig.params.push(AbiParam::new(ty));
            }
            sig.returns.push(AbiParam::new(ty));
            let id = self
                .module
                .declare_function(name, Linkage::Import, &sig)
                .map_err(codegen_err)?;
            self.math_ids.insert(name, id);
        }
        Ok(())
    }

    /// Define an exported `fn(ptr, ptr, ptr)` whose body is produced by
    /// `build`. The three pointer arguments are handed to the callback
    /// along with the builder, the module and the imported math ids.
    pub(crate) fn define_fn3(
        &mut self,
        name: &str,
        build: impl FnOnce(
            &mut FunctionBuilder,
            &mut JITModule,
            &HashMap<&'static str, FuncId>,
            [Value; 3],
        ) -> Result<(), Error>,
    ) -> Result<FuncId, Error> {
        let ptr_ty = self.module.target_config().pointer_type();
        let mut sig = self.module.make_signature();
        sig.params.push(AbiParam::new(ptr_ty));
        sig.params.push(AbiParam::new(ptr_ty));
        sig.params.push(AbiParam::new(ptr_ty));
        let func_id = self
            .module
            .declare_function(name, Linkage::Export, &sig)
            .map_err(codegen_err)?;
        self.ctx.func.signature = sig;

        {
            let mut bcx = FunctionBuilder::new(&mut self.ctx.func, &mut self.fbcx);
            let block = bcx.create_block();
            bcx.append_block_params_for_function_params(block);
            bcx.switch_to_block(block);
            bcx.seal_block(block);
            let params = bcx.block_params(block).to_vec();
            build(
                &mut bcx,
                &mut self.module,
                &self.math_ids,
                [params[0], params[1], params[2]],
            )?;
            bcx.ins().return_(&[]);
            bcx.finalize();
        }

        self.clif
            .push_str(&format!("; {}\n{}\n", name, self.ctx.func.display()));
        self.module
            .define_function(func_id, &mut self.ctx)
            .map_err(codegen_err)?;
        self.module.clear_context(&mut self.ctx);
        self.ids.insert(name.to_string(), func_id);
        Ok(func_id)
    }

    pub(crate) fn finish(mut self) -> Result<CompiledModule, Error> {
        self.module.finalize_definitions().map_err(codegen_err)?;
        Ok(CompiledModule {
            module: Some(self.module),
            clif: self.clif,
            ids: self.ids,
        })
    }
}

/// A finalized JIT module and its emitted IR text.
pub(crate) struct CompiledModule {
    module: Option<JITModule>,
    clif: String,
    ids: HashMap<String, FuncId>,
}

// The module's code memory is exclusively owned and only ever entered
// through the function pointers held next to it in the same integrator.
unsafe impl Send for CompiledModule {}

impl CompiledModule {
    pub(crate) fn clif(&self) -> &str {
        &self.clif
    }

    fn get(&self, name: &str) -> Result<*const u8, Error> {
        let id = self
            .ids
            .get(name)
            .copied()
            .ok_or_else(|| Error::Codegen(format!("unknown function '{}'", name)))?;
        Ok(self
            .module
            .as_ref()
            .expect("module is present until drop")
            .get_finalized_function(id))
    }
}

impl Drop for CompiledModule {
    fn drop(&mut self) {
        if let Some(module) = self.module.take() {
            // All function pointers derived from this module live in the
            // same owner and are dropped together with it.
            unsafe { module.free_memory() };
        }
    }
}

/// The compiled artifacts backing one integrator.
pub(crate) struct Compiled<F: JitFloat> {
    pub(crate) module: CompiledModule,
    pub(crate) jet_r: JetFn<F>,
    pub(crate) jet_a: JetFn<F>,
    pub(crate) upd_r: UpdFn<F>,
    pub(crate) upd_a: UpdFn<F>,
}

/// Emit and compile the jet and update functions for both Taylor orders.
///
/// When the two orders coincide a single pair is emitted and bound to both
/// slots.
pub(crate) fn compile<F: JitFloat>(
    dc: &Decomposition,
    order_r: u32,
    order_a: u32,
    batch: usize,
    opt_level: u32,
) -> Result<Compiled<F>, Error> {
    let max_order = order_r.max(order_a) as usize;
    let total_bytes = (max_order + 1)
        .checked_mul(dc.len())
        .and_then(|x| x.checked_mul(batch))
        .and_then(|x| x.checked_mul(F::TYPE.bytes() as usize))
        .filter(|&x| x <= i32::MAX as usize);
    if total_bytes.is_none() {
        return Err(Error::Overflow(
            "the size of the jet of derivatives overflows the addressable range".to_string(),
        ));
    }

    let mut mb = ModuleBuilder::new(opt_level)?;
    mb.declare_math(F::SYMS, F::TYPE)?;

    jet::emit_jet(&mut mb, "jet_r", dc, order_r, batch, F::TYPE, F::SYMS)?;
    update::emit_update(&mut mb, "upd_r", dc.n_eq(), dc.len(), order_r, batch, F::TYPE)?;
    if order_a != order_r {
        jet::emit_jet(&mut mb, "jet_a", dc, order_a, batch, F::TYPE, F::SYMS)?;
        update::emit_update(&mut mb, "upd_a", dc.n_eq(), dc.len(), order_a, batch, F::TYPE)?;
    }

    let module = mb.finish()?;
    debug!(
        "compiled taylor module: {} u-variable(s), orders ({}, {}), batch {}",
        dc.len(),
        order_r,
        order_a,
        batch
    );

    unsafe {
        let jet_r = std::mem::transmute::<*const u8, JetFn<F>>(module.get("jet_r")?);
        let upd_r = std::mem::transmute::<*const u8, UpdFn<F>>(module.get("upd_r")?);
        let (jet_a, upd_a) = if order_a != order_r {
            (
                std::mem::transmute::<*const u8, JetFn<F>>(module.get("jet_a")?),
                std::mem::transmute::<*const u8, UpdFn<F>>(module.get("upd_a")?),
            )
        } else {
            (jet_r, upd_r)
        };
        Ok(Compiled {
            module,
            jet_r,
            jet_a,
            upd_r,
            upd_a,
        })
    }
}
