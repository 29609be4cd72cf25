use crate::config::TemplateConfig;
use crate::context::TxContext;
use crate::engine::Mapper;
use crate::error::Result;
use crate::template::SessionTemplate;
use tracing::debug;

/// Resolves mapper implementations bound to a [`SessionTemplate`].
///
/// Mappers obtained here run every statement through a
/// [`SessionProxy`](crate::SessionProxy) for the given context, so they join
/// the scope's bound session like any other proxy call.
#[derive(Debug, Clone)]
pub struct MapperResolver {
    template: SessionTemplate,
    add_to_config: bool,
}

impl MapperResolver {
    pub fn new(template: SessionTemplate) -> Self {
        Self {
            template,
            add_to_config: true,
        }
    }

    pub fn from_config(template: SessionTemplate, config: &TemplateConfig) -> Self {
        Self::new(template).add_to_config(config.add_mappers_to_config)
    }

    /// Whether unknown mappers are registered with the factory's
    /// configuration before generation. Enabled by default.
    pub fn add_to_config(mut self, add_to_config: bool) -> Self {
        self.add_to_config = add_to_config;
        self
    }

    pub fn template(&self) -> &SessionTemplate {
        &self.template
    }

    /// Returns an implementation of `M` running inside `ctx`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`](crate::Error::Configuration) if `M`
    /// is unknown to the factory's configuration and registration is disabled.
    pub fn resolve<M: Mapper>(&self, ctx: &TxContext) -> Result<M> {
        let mappers = self.template.factory().configuration().mappers();
        if self.add_to_config && mappers.add_mapper::<M>() {
            debug!(mapper = M::NAMESPACE, "registered mapper with factory configuration");
        }
        self.template.session(ctx).mapper::<M>()
    }
}
