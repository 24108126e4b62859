//! 洋葱式中间件编排引擎。
//!
//! # 教案式概览
//! - **意图（Why）**：Server 的方法链（解码 → 业务处理 → 编码）与 Client 的拦截器链执行同一种算法，
//!   只在上下文类型与结果类型上有所不同，因此引擎对二者完全泛型。
//! - **结构（How）**：
//!   - [`Middleware`]：单个步骤，接收可变上下文与 [`Next`]；
//!   - [`Next`]：调用链剩余部分的句柄，`run` 推进到下一个步骤（或终端步骤）；
//!   - [`compose`]：把有序步骤固化为可重复调用的 [`Composed`]。
//! - **契约（What）**：
//!   - 执行严格顺序、深度优先；某步骤不调用 `next` 时链路就此停止，结果由该步骤决定；
//!   - 同一步骤第二次调用 `next` 返回 [`RpcError::Config`]，且不会重复执行下游步骤；
//!   - 链路越过最后一个步骤（且没有终端步骤）时返回 `R::default()`；
//!   - 每次 [`Composed::call`] 拥有独立的进度计数，组合结果可被并发调用。
//! - **设计取舍（Trade-offs）**：列表只能容纳实现了 [`Middleware`] 的值，“不可调用的条目”在类型层面
//!   就无法构造，因此不需要运行期的装配检查。

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{Result, RpcError};
use crate::future::BoxFuture;

/// 链路中的单个步骤。
///
/// # 契约说明（What）
/// - `ctx` 在整个链路中以可变借用逐层传递，下游步骤返回后上游仍可继续读写；
/// - 下游的错误经由 `next.run(ctx).await?` 原样向上传播，步骤可以选择捕获并改写。
pub trait Middleware<C, R>: Send + Sync {
    fn handle<'a>(&'a self, ctx: &'a mut C, next: Next<'a, C, R>) -> BoxFuture<'a, Result<R>>;

    /// 诊断名称，默认取实现类型名。
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// 指向链路剩余部分的句柄。
pub struct Next<'a, C, R> {
    steps: &'a [Arc<dyn Middleware<C, R>>],
    terminal: Option<&'a dyn Middleware<C, R>>,
    index: usize,
    reached: &'a AtomicUsize,
}

impl<'a, C, R> Next<'a, C, R>
where
    C: Send + 'static,
    R: Default + Send + 'static,
{
    /// 执行下一个步骤。
    ///
    /// # 执行逻辑（How）
    /// - `reached` 记录本次调用已推进到的最远位置，`fetch_max` 同时完成“推进”与“重复检测”；
    /// - 检测在返回 Future 之前同步完成，即使调用方先创建两个 Future 再依次等待也能识别。
    pub fn run<'b>(&'b self, ctx: &'b mut C) -> BoxFuture<'b, Result<R>>
    where
        'a: 'b,
    {
        let position = self.index;
        let previous = self.reached.fetch_max(position + 1, Ordering::AcqRel);
        if previous > position {
            return Box::pin(std::future::ready(Err(RpcError::Config(
                "next() called multiple times".into(),
            ))));
        }

        let downstream = Next {
            steps: self.steps,
            terminal: self.terminal,
            index: position + 1,
            reached: self.reached,
        };

        if let Some(step) = self.steps.get(position) {
            return step.handle(ctx, downstream);
        }
        match self.terminal {
            Some(terminal) if position == self.steps.len() => terminal.handle(ctx, downstream),
            _ => Box::pin(std::future::ready(Ok(R::default()))),
        }
    }

    /// 剩余未执行的步骤数（含终端步骤）。
    pub fn remaining(&self) -> usize {
        let total = self.steps.len() + usize::from(self.terminal.is_some());
        total.saturating_sub(self.index)
    }
}

impl<C, R> fmt::Debug for Next<'_, C, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next")
            .field("index", &self.index)
            .field("steps", &self.steps.len())
            .field("terminal", &self.terminal.is_some())
            .finish()
    }
}

/// 固化后的链路。克隆代价为一次引用计数递增。
pub struct Composed<C, R> {
    steps: Arc<[Arc<dyn Middleware<C, R>>]>,
}

impl<C, R> Clone for Composed<C, R> {
    fn clone(&self) -> Self {
        Self {
            steps: Arc::clone(&self.steps),
        }
    }
}

impl<C, R> fmt::Debug for Composed<C, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.steps.iter().map(|step| step.name()))
            .finish()
    }
}

impl<C, R> Composed<C, R>
where
    C: Send + 'static,
    R: Default + Send + 'static,
{
    /// 以 `terminal` 作为最后一步执行整条链路。
    pub fn call<'a>(
        &'a self,
        ctx: &'a mut C,
        terminal: Option<&'a dyn Middleware<C, R>>,
    ) -> BoxFuture<'a, Result<R>> {
        Box::pin(async move {
            let reached = AtomicUsize::new(0);
            let next = Next {
                steps: &self.steps,
                terminal,
                index: 0,
                reached: &reached,
            };
            next.run(ctx).await
        })
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// 把有序步骤组合为一条链路。
pub fn compose<C, R, I>(steps: I) -> Composed<C, R>
where
    I: IntoIterator<Item = Arc<dyn Middleware<C, R>>>,
{
    Composed {
        steps: steps.into_iter().collect(),
    }
}

/// 以闭包实现的步骤，见 [`middleware_fn`]。
pub struct FnMiddleware<F> {
    f: F,
}

impl<C, R, F> Middleware<C, R> for FnMiddleware<F>
where
    F: for<'a> Fn(&'a mut C, Next<'a, C, R>) -> BoxFuture<'a, Result<R>> + Send + Sync,
{
    fn handle<'a>(&'a self, ctx: &'a mut C, next: Next<'a, C, R>) -> BoxFuture<'a, Result<R>> {
        (self.f)(ctx, next)
    }

    fn name(&self) -> &'static str {
        "fn"
    }
}

/// 把闭包适配为 [`Middleware`]。
///
/// 闭包需返回装箱的 Future：
///
/// ```ignore
/// let step = middleware_fn::<Ctx, String, _>(|ctx, next| {
///     Box::pin(async move {
///         let body = next.run(ctx).await?;
///         Ok(format!("{body}!"))
///     })
/// });
/// ```
pub fn middleware_fn<C, R, F>(f: F) -> Arc<dyn Middleware<C, R>>
where
    C: 'static,
    R: 'static,
    F: for<'a> Fn(&'a mut C, Next<'a, C, R>) -> BoxFuture<'a, Result<R>> + Send + Sync + 'static,
{
    Arc::new(FnMiddleware { f })
}
